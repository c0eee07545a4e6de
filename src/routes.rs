use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::AppError;
use crate::gpio::{Direction, Pull};
use crate::manager::{EventRecord, GpioManager, WatchSettings};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<GpioManager>,
}

#[derive(Deserialize)]
struct SetupPayload {
    direction: Direction,
    #[serde(default)]
    pull: Pull,
}

#[derive(Deserialize)]
struct PwmStartPayload {
    period_ms: u64,
    #[serde(default)]
    duty_cycle: f64,
}

#[derive(Deserialize)]
struct DutyCyclePayload {
    duty_cycle: f64,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EventRecord>,
    pin_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if pin_filter.is_none_or(|p| p == event.pin_id)
                            && let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = AppError::Driver(format!("Event stream lagged by {n} messages"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl AppState {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/gpios")
                    .route(web::get().to(list_gpios))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpios/events")
                    .route(web::get().to(events_ws_all))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{pin_id}")
                    .route(web::get().to(pin_descriptor))
                    .route(web::delete().to(release_pin))
                    .route(not_allowed(&[Method::GET, Method::DELETE])),
            )
            .service(
                web::resource("/gpio/{pin_id}/info")
                    .route(web::get().to(pin_info))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{pin_id}/setup")
                    .route(web::post().to(setup_pin))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/gpio/{pin_id}/value")
                    .route(web::get().to(get_value))
                    .route(web::post().to(set_value))
                    .route(not_allowed(&[Method::GET, Method::POST])),
            )
            .service(
                web::resource("/gpio/{pin_id}/watch")
                    .route(web::post().to(watch_pin))
                    .route(web::delete().to(unwatch_pin))
                    .route(not_allowed(&[Method::POST, Method::DELETE])),
            )
            .service(
                web::resource("/gpio/{pin_id}/pwm")
                    .route(web::post().to(start_pwm))
                    .route(web::put().to(set_duty_cycle))
                    .route(web::delete().to(stop_pwm))
                    .route(not_allowed(&[Method::POST, Method::PUT, Method::DELETE])),
            )
            .service(
                web::resource("/gpio/{pin_id}/event")
                    .route(web::get().to(get_last_event))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{pin_id}/events")
                    .route(web::get().to(get_events))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{pin_id}/events/ws")
                    .route(web::get().to(events_ws_pin))
                    .route(not_allowed(&[Method::GET])),
            )
    }
}

async fn list_gpios(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let pins = state.manager.list_pins();

    Ok(web::Json(pins))
}

async fn pin_descriptor(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;
    let desc = state.manager.pin_descriptor(pin_id)?;

    Ok(web::Json(desc))
}

async fn pin_info(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;
    let info = state.manager.pin_info(pin_id)?;

    Ok(web::Json(info))
}

async fn setup_pin(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;
    let payload: SetupPayload = parse_json_payload(&body, "setup")?;

    let mode = state
        .manager
        .setup(pin_id, payload.direction, payload.pull)?;

    Ok(web::Json(mode))
}

async fn release_pin(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;

    state.manager.release(pin_id)?;

    Ok(HttpResponse::Ok())
}

async fn get_value(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;

    let level = state.manager.read_value(pin_id)?;

    Ok(web::Json(level.as_bit()))
}

async fn set_value(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;
    let value = parse_value_payload(&body)?;

    state.manager.write_value(pin_id, value)?;

    Ok(HttpResponse::Ok())
}

async fn watch_pin(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;
    let settings: WatchSettings = parse_json_payload(&body, "watch")?;

    state.manager.watch(pin_id, settings)?;

    Ok(web::Json(settings))
}

async fn unwatch_pin(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;

    state.manager.unwatch(pin_id)?;

    Ok(HttpResponse::Ok())
}

async fn start_pwm(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;
    let payload: PwmStartPayload = parse_json_payload(&body, "pwm")?;

    let mode = state
        .manager
        .start_pwm(pin_id, payload.period_ms, payload.duty_cycle)?;

    Ok(web::Json(mode))
}

async fn set_duty_cycle(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;
    let payload: DutyCyclePayload = parse_json_payload(&body, "duty cycle")?;

    let mode = state.manager.set_duty_cycle(pin_id, payload.duty_cycle)?;

    Ok(web::Json(mode))
}

async fn stop_pwm(req: HttpRequest, state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;

    state.manager.stop_pwm(pin_id)?;

    Ok(HttpResponse::Ok())
}

async fn get_last_event(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;

    let last = state.manager.get_last_event(pin_id)?;

    match last {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let pin_id = parse_pin_id(&req)?;

    let events = state.manager.get_events(pin_id, query.limit)?;

    Ok(web::Json(events))
}

async fn events_ws_all(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    open_event_websocket(&req, stream, &state, None)
}

async fn events_ws_pin(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let pin_id = parse_pin_id(&req)?;
    state.manager.pin_info(pin_id)?;

    open_event_websocket(&req, stream, &state, Some(pin_id))
}

fn open_event_websocket(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState,
    pin_filter: Option<u32>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| AppError::InvalidValue(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, pin_filter).await;
    });

    Ok(response)
}

fn parse_value_payload(body: &[u8]) -> Result<u8, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => text
            .trim()
            .parse::<u8>()
            .map_err(|_| AppError::InvalidValue("Value must be an integer".into())),
        _ => Err(AppError::InvalidValue(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_json_payload<T: for<'de> Deserialize<'de>>(body: &[u8], what: &str) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue(format!("Empty {what} payload")));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid {what} payload: {e}")))
}

fn parse_pin_id(req: &HttpRequest) -> Result<u32, AppError> {
    let pin_id = req
        .match_info()
        .get("pin_id")
        .ok_or_else(|| AppError::InvalidValue("Missing pin id".into()))?;
    let pin_id = pin_id
        .parse::<u32>()
        .map_err(|_| AppError::InvalidValue("Invalid pin id".into()))?;

    Ok(pin_id)
}

fn not_allowed(methods: &'static [Method]) -> actix_web::Route {
    web::route()
        .guard(guard_not_methods(methods))
        .to(method_not_allowed)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &'static [Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
