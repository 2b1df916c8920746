use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use draw_core::{
    build_chain, Assignment, Chain, ChainLink, DerangementGenerator, DrawError, ParticipantId,
};
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

mod config;

pub use config::{Config, ConfigError};

const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";
const HOST_TOKEN_HEADER: &str = "x-host-token";

#[derive(Clone)]
pub struct AppState {
    exchanges: Arc<RwLock<HashMap<String, ExchangeRecord>>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ServerMessage>>>>,
    config: Arc<Config>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::from_config(Config::default())
    }
}

impl AppState {
    fn from_config(config: Config) -> Self {
        Self {
            exchanges: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Builds the state and, when a persistence file is configured, loads the
    /// exchanges saved there.
    pub async fn new(config: Config) -> Self {
        let state = Self::from_config(config);
        let Some(path) = state.config.persist_path.clone() else {
            return state;
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, ExchangeRecord>>(&bytes) {
                Ok(saved) => {
                    let mut channels = state.channels.write().await;
                    for exchange_id in saved.keys() {
                        let (tx, _) = broadcast::channel(32);
                        channels.insert(exchange_id.clone(), tx);
                    }
                    info!(
                        path = %path.display(),
                        exchanges = saved.len(),
                        "loaded saved exchanges"
                    );
                    *state.exchanges.write().await = saved;
                }
                Err(err) => warn!(path = %path.display(), %err, "ignoring unreadable state file"),
            },
            Err(err) => info!(path = %path.display(), %err, "starting without saved state"),
        }
        state
    }

    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        Self::new(Config {
            persist_path: Some(path.into()),
            ..Config::default()
        })
        .await
    }

    /// Writes the exchanges to the state file. Callers pass the map while still
    /// holding the write guard, so the file follows the order of mutations.
    async fn persist(&self, exchanges: &HashMap<String, ExchangeRecord>) {
        if let Some(path) = &self.config.persist_path {
            match serde_json::to_vec_pretty(exchanges) {
                Ok(json) => {
                    if let Err(err) = tokio::fs::write(path, json).await {
                        error!(path = %path.display(), %err, "persist error");
                    }
                }
                Err(err) => error!(%err, "could not serialize exchanges"),
            }
        }
    }

    async fn publish(
        &self,
        exchange_id: &str,
        messages: impl IntoIterator<Item = ServerMessage>,
    ) {
        if let Some(tx) = self.channels.read().await.get(exchange_id) {
            for msg in messages {
                // No subscribers is fine.
                let _ = tx.send(msg);
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePhase {
    Registration,
    Drawn,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub id: String,
    pub host_token: String,
    pub phase: ExchangePhase,
    /// One flag for the whole exchange, not per participant.
    pub revealed: bool,
    pub draw_count: u32,
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub name: String,
    pub joined_at: u64,
    /// Organizers administer the exchange but are never drawn.
    #[serde(default)]
    pub organizer: bool,
    #[serde(default)]
    pub wishes: Vec<String>,
    pub drawn_receiver: Option<ParticipantId>,
}

impl ExchangeRecord {
    fn participant(&self, id: &str) -> Option<&ParticipantRecord> {
        self.participants.iter().find(|p| p.id == id)
    }

    fn name_of(&self, id: &str) -> Option<String> {
        self.participant(id).map(|p| p.name.clone())
    }

    /// Non-organizers in join order.
    fn eligible(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|p| !p.organizer)
            .map(|p| p.id.clone())
            .collect()
    }

    fn stored_mapping(&self) -> HashMap<ParticipantId, ParticipantId> {
        self.participants
            .iter()
            .filter_map(|p| p.drawn_receiver.clone().map(|r| (p.id.clone(), r)))
            .collect()
    }

    /// Replaces every stored receiver; nobody keeps a receiver from an older draw.
    fn apply_assignment(&mut self, assignment: &Assignment<ParticipantId>) {
        for participant in self.participants.iter_mut() {
            participant.drawn_receiver = assignment.receiver_of(&participant.id).cloned();
        }
        self.phase = ExchangePhase::Drawn;
        self.revealed = false;
        self.draw_count += 1;
    }

    fn link_view(&self, link: &ChainLink<ParticipantId>, cycle: usize) -> LinkView {
        LinkView {
            cycle,
            giver_id: link.giver.clone(),
            giver_name: self.name_of(&link.giver),
            receiver_id: link.receiver.clone(),
            receiver_name: self.name_of(&link.receiver),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/exchange", post(create_exchange))
        .route("/exchange/:id/join", post(join_exchange))
        .route("/exchange/:id/wishes", post(submit_wishes))
        .route("/exchange/:id/draw", post(draw_exchange))
        .route("/exchange/:id/reveal", post(set_reveal))
        .route("/exchange/:id/assignment/:participant_id", get(get_assignment))
        .route("/exchange/:id/chain", get(get_chain))
        .route("/exchange/:id", get(get_exchange))
        .route("/ws/:id/:participant_id", get(ws_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct CreateExchangeResponse {
    exchange_id: String,
    host_token: String,
}

#[derive(Deserialize)]
struct JoinRequest {
    name: String,
    #[serde(default)]
    organizer: bool,
}

#[derive(Serialize)]
struct JoinResponse {
    participant_id: ParticipantId,
}

#[derive(Deserialize)]
struct WishesRequest {
    participant_id: ParticipantId,
    wishes: Vec<String>,
}

#[derive(Serialize)]
struct WishesResponse {
    participant_id: ParticipantId,
    wishes: Vec<String>,
}

#[derive(Deserialize)]
struct DrawParams {
    seed: Option<u64>,
}

#[derive(Serialize)]
struct DrawResponse {
    phase: ExchangePhase,
    draw_count: u32,
    participants: usize,
}

#[derive(Deserialize)]
struct RevealRequest {
    revealed: bool,
}

#[derive(Serialize)]
struct AssignmentView {
    giver_id: ParticipantId,
    receiver_id: ParticipantId,
    receiver_name: String,
    wishes: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct LinkView {
    cycle: usize,
    giver_id: ParticipantId,
    giver_name: Option<String>,
    receiver_id: ParticipantId,
    receiver_name: Option<String>,
}

#[derive(Serialize)]
struct ChainView {
    cycle_count: usize,
    links: Vec<LinkView>,
}

#[derive(Clone, Debug, Serialize)]
struct ParticipantView {
    id: ParticipantId,
    name: String,
    organizer: bool,
    wishes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drawn_receiver: Option<ParticipantId>,
}

#[derive(Clone, Debug, Serialize)]
struct ExchangeView {
    id: String,
    phase: ExchangePhase,
    revealed: bool,
    draw_count: u32,
    participants: Vec<ParticipantView>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ExchangeEvent {
    ParticipantJoined { participant_id: ParticipantId, name: String },
    DrawCompleted { draw_count: u32, participants: usize },
    RevealChanged { revealed: bool },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    State(ExchangeView),
    Event(ExchangeEvent),
}

async fn create_exchange(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let provided = headers
        .get(ADMIN_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != state.config.admin_password {
        return (StatusCode::UNAUTHORIZED, "invalid admin password").into_response();
    }

    let exchange_id = Uuid::new_v4().to_string();
    let host_token = Uuid::new_v4().to_string();
    let record = ExchangeRecord {
        id: exchange_id.clone(),
        host_token: host_token.clone(),
        phase: ExchangePhase::Registration,
        revealed: false,
        draw_count: 0,
        participants: Vec::new(),
    };

    let (tx, _) = broadcast::channel(32);
    state.channels.write().await.insert(exchange_id.clone(), tx);
    let mut exchanges = state.exchanges.write().await;
    exchanges.insert(exchange_id.clone(), record);
    state.persist(&exchanges).await;
    drop(exchanges);
    info!(%exchange_id, "exchange created");

    (
        StatusCode::CREATED,
        Json(CreateExchangeResponse {
            exchange_id,
            host_token,
        }),
    )
        .into_response()
}

async fn join_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
    Json(payload): Json<JoinRequest>,
) -> impl IntoResponse {
    let name = payload.name.trim();
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "name required").into_response();
    }

    let mut exchanges = state.exchanges.write().await;
    let exchange = match exchanges.get_mut(&exchange_id) {
        Some(exchange) => exchange,
        None => return (StatusCode::NOT_FOUND, "exchange not found").into_response(),
    };

    // A new participant would invalidate the current draw.
    if !matches!(exchange.phase, ExchangePhase::Registration) {
        return (StatusCode::CONFLICT, "draw already happened").into_response();
    }

    if exchange.participants.iter().any(|p| p.name == name) {
        return (StatusCode::CONFLICT, "name taken").into_response();
    }

    let participant_id = Uuid::new_v4().to_string();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    exchange.participants.push(ParticipantRecord {
        id: participant_id.clone(),
        name: name.to_string(),
        joined_at: now,
        organizer: payload.organizer,
        wishes: Vec::new(),
        drawn_receiver: None,
    });
    let view = to_view(exchange);

    state.persist(&exchanges).await;
    drop(exchanges);
    info!(%exchange_id, %participant_id, organizer = payload.organizer, "participant joined");
    state
        .publish(
            &exchange_id,
            [
                ServerMessage::Event(ExchangeEvent::ParticipantJoined {
                    participant_id: participant_id.clone(),
                    name: name.to_string(),
                }),
                ServerMessage::State(view),
            ],
        )
        .await;

    (StatusCode::OK, Json(JoinResponse { participant_id })).into_response()
}

async fn submit_wishes(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
    Json(payload): Json<WishesRequest>,
) -> impl IntoResponse {
    let mut exchanges = state.exchanges.write().await;
    let exchange = match exchanges.get_mut(&exchange_id) {
        Some(e) => e,
        None => return (StatusCode::NOT_FOUND, "exchange not found").into_response(),
    };

    let Some(participant) = exchange
        .participants
        .iter_mut()
        .find(|p| p.id == payload.participant_id)
    else {
        return (StatusCode::NOT_FOUND, "participant not found").into_response();
    };

    participant.wishes = payload
        .wishes
        .iter()
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect();
    let response = WishesResponse {
        participant_id: participant.id.clone(),
        wishes: participant.wishes.clone(),
    };

    state.persist(&exchanges).await;
    drop(exchanges);

    (StatusCode::OK, Json(response)).into_response()
}

async fn get_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> impl IntoResponse {
    let exchanges = state.exchanges.read().await;
    let Some(exchange) = exchanges.get(&exchange_id) else {
        return (StatusCode::NOT_FOUND, "exchange not found").into_response();
    };

    (StatusCode::OK, Json(to_view(exchange))).into_response()
}

/// Draws a fresh assignment for every eligible participant. The write lock is
/// held for the whole draw, so concurrent draws on one exchange serialize.
async fn draw_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<DrawParams>,
) -> Result<Json<DrawResponse>, ExchangeError> {
    let mut exchanges = state.exchanges.write().await;
    let exchange = exchanges
        .get_mut(&exchange_id)
        .ok_or(ExchangeError::ExchangeNotFound)?;
    authorize_host(&headers, exchange)?;

    let eligible = exchange.eligible();
    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(|| ChaCha8Rng::from_entropy());
    let generator = DerangementGenerator::new(state.config.attempt_limit);
    let assignment = generator.generate(&eligible, &mut rng).map_err(|err| {
        warn!(%exchange_id, %err, "draw failed");
        ExchangeError::from(err)
    })?;

    exchange.apply_assignment(&assignment);
    let response = DrawResponse {
        phase: exchange.phase.clone(),
        draw_count: exchange.draw_count,
        participants: eligible.len(),
    };
    let view = to_view(exchange);

    state.persist(&exchanges).await;
    drop(exchanges);
    info!(
        %exchange_id,
        participants = eligible.len(),
        draw_count = response.draw_count,
        "draw completed"
    );
    state
        .publish(
            &exchange_id,
            [
                ServerMessage::Event(ExchangeEvent::DrawCompleted {
                    draw_count: response.draw_count,
                    participants: response.participants,
                }),
                ServerMessage::State(view),
            ],
        )
        .await;

    Ok(Json(response))
}

async fn set_reveal(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<RevealRequest>,
) -> Result<Json<ExchangeView>, ExchangeError> {
    let mut exchanges = state.exchanges.write().await;
    let exchange = exchanges
        .get_mut(&exchange_id)
        .ok_or(ExchangeError::ExchangeNotFound)?;
    authorize_host(&headers, exchange)?;
    if !matches!(exchange.phase, ExchangePhase::Drawn) {
        return Err(ExchangeError::NotDrawn);
    }

    exchange.revealed = payload.revealed;
    let view = to_view(exchange);

    state.persist(&exchanges).await;
    drop(exchanges);
    info!(%exchange_id, revealed = payload.revealed, "reveal flag changed");
    state
        .publish(
            &exchange_id,
            [
                ServerMessage::Event(ExchangeEvent::RevealChanged {
                    revealed: payload.revealed,
                }),
                ServerMessage::State(view.clone()),
            ],
        )
        .await;

    Ok(Json(view))
}

async fn get_assignment(
    State(state): State<AppState>,
    Path((exchange_id, participant_id)): Path<(String, String)>,
) -> Result<Json<AssignmentView>, ExchangeError> {
    let exchanges = state.exchanges.read().await;
    let exchange = exchanges
        .get(&exchange_id)
        .ok_or(ExchangeError::ExchangeNotFound)?;
    let giver = exchange
        .participant(&participant_id)
        .ok_or(ExchangeError::ParticipantNotFound)?;
    if !matches!(exchange.phase, ExchangePhase::Drawn) {
        return Err(ExchangeError::NotDrawn);
    }

    let receiver_id = giver
        .drawn_receiver
        .as_ref()
        .ok_or(ExchangeError::NotEligible)?;
    let receiver = exchange
        .participant(receiver_id)
        .ok_or(ExchangeError::ParticipantNotFound)?;

    Ok(Json(AssignmentView {
        giver_id: giver.id.clone(),
        receiver_id: receiver.id.clone(),
        receiver_name: receiver.name.clone(),
        wishes: receiver.wishes.clone(),
    }))
}

/// Rebuilds the gift chain from the stored receivers, cycle by cycle. The host
/// can always read it; everyone else only once the exchange is revealed.
async fn get_chain(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ChainView>, ExchangeError> {
    let exchanges = state.exchanges.read().await;
    let exchange = exchanges
        .get(&exchange_id)
        .ok_or(ExchangeError::ExchangeNotFound)?;
    if headers.contains_key(HOST_TOKEN_HEADER) {
        authorize_host(&headers, exchange)?;
    } else if !exchange.revealed {
        return Err(ExchangeError::NotRevealed);
    }
    if !matches!(exchange.phase, ExchangePhase::Drawn) {
        return Err(ExchangeError::NotDrawn);
    }

    let chain = build_chain(&exchange.stored_mapping(), &exchange.eligible()).map_err(|err| {
        warn!(%exchange_id, %err, "stored assignment is inconsistent");
        ExchangeError::InconsistentRecords {
            message: err.to_string(),
            partial: link_views(exchange, err.partial()),
        }
    })?;

    Ok(Json(ChainView {
        cycle_count: chain.cycle_count(),
        links: link_views(exchange, &chain),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((exchange_id, participant_id)): Path<(String, String)>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, exchange_id, participant_id))
}

async fn handle_socket(
    stream: WebSocket,
    state: AppState,
    exchange_id: String,
    participant_id: String,
) {
    let (mut sender, mut receiver) = stream.split();

    let snapshot = {
        let exchanges = state.exchanges.read().await;
        let Some(exchange) = exchanges.get(&exchange_id) else {
            let _ = sender.send(Message::Text("unknown exchange".into())).await;
            return;
        };
        if exchange.participant(&participant_id).is_none() {
            let _ = sender.send(Message::Text("unknown participant".into())).await;
            return;
        }
        to_view(exchange)
    };

    let mut rx = {
        let mut channels = state.channels.write().await;
        channels
            .entry(exchange_id.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(32);
                tx
            })
            .subscribe()
    };

    let Ok(text) = serde_json::to_string(&ServerMessage::State(snapshot)) else {
        return;
    };
    if sender.send(Message::Text(text)).await.is_err() {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Clients only listen; drain their frames until they close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }
}

fn authorize_host(headers: &HeaderMap, exchange: &ExchangeRecord) -> Result<(), ExchangeError> {
    let token = headers
        .get(HOST_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ExchangeError::MissingHostToken)?;
    if token != exchange.host_token {
        return Err(ExchangeError::InvalidHostToken);
    }
    Ok(())
}

fn link_views(exchange: &ExchangeRecord, chain: &Chain<ParticipantId>) -> Vec<LinkView> {
    let mut views = Vec::with_capacity(chain.len());
    for (cycle, links) in chain.cycles().enumerate() {
        views.extend(links.iter().map(|link| exchange.link_view(link, cycle)));
    }
    // A partial chain may end inside an unfinished cycle.
    let closed = views.len();
    let open_cycle = chain.cycle_count();
    views.extend(
        chain.links()[closed..]
            .iter()
            .map(|link| exchange.link_view(link, open_cycle)),
    );
    views
}

fn to_view(exchange: &ExchangeRecord) -> ExchangeView {
    ExchangeView {
        id: exchange.id.clone(),
        phase: exchange.phase.clone(),
        revealed: exchange.revealed,
        draw_count: exchange.draw_count,
        participants: exchange
            .participants
            .iter()
            .map(|p| ParticipantView {
                id: p.id.clone(),
                name: p.name.clone(),
                organizer: p.organizer,
                wishes: p.wishes.clone(),
                drawn_receiver: if exchange.revealed {
                    p.drawn_receiver.clone()
                } else {
                    None
                },
            })
            .collect(),
    }
}

#[derive(Debug, thiserror::Error)]
enum ExchangeError {
    #[error("exchange not found")]
    ExchangeNotFound,
    #[error("participant not found")]
    ParticipantNotFound,
    #[error("participant is not part of the draw")]
    NotEligible,
    #[error("host token required")]
    MissingHostToken,
    #[error("invalid host token")]
    InvalidHostToken,
    #[error("exchange has not been drawn")]
    NotDrawn,
    #[error("assignments are not revealed")]
    NotRevealed,
    #[error("draw failed: {0}")]
    Draw(#[from] DrawError),
    #[error("{message}")]
    InconsistentRecords {
        message: String,
        partial: Vec<LinkView>,
    },
}

impl ExchangeError {
    fn status(&self) -> StatusCode {
        match self {
            ExchangeError::ExchangeNotFound | ExchangeError::ParticipantNotFound => {
                StatusCode::NOT_FOUND
            }
            ExchangeError::NotEligible | ExchangeError::NotDrawn => StatusCode::CONFLICT,
            ExchangeError::MissingHostToken | ExchangeError::InvalidHostToken => {
                StatusCode::UNAUTHORIZED
            }
            ExchangeError::NotRevealed => StatusCode::FORBIDDEN,
            ExchangeError::Draw(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ExchangeError::Draw(_) => StatusCode::BAD_REQUEST,
            ExchangeError::InconsistentRecords { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct FaultBody<'a> {
    error: String,
    partial: &'a [LinkView],
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ExchangeError::InconsistentRecords { partial, .. } => (
                status,
                Json(FaultBody {
                    error: self.to_string(),
                    partial,
                }),
            )
                .into_response(),
            _ => (status, self.to_string()).into_response(),
        }
    }
}
