use std::{
    convert::Infallible,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex, Notify},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use hdmi_mux_common::{
    command::command_preview,
    portal::{render_control_page, render_setup_page, SAVE_ACK_BODY},
    provisioning::{save_credentials, RESTART_DELAY_MS},
    query::query_param,
    store::STORE_NAMESPACE,
    ApplyPolicy, BootPlan, BootstrapMode, CredentialStore, DeviceConfig, ErrorBody, KeyValueStore,
    Line, MqttConfig, MuxController, MuxDriver, MuxState, MuxStatusPayload, NetworkCredential,
    OutputLineSet, OutputLines, ProvisioningSession, RuntimeConfig, SaveError, SaveRequest,
    ScannedNetwork, StoreError, TOPIC_MUX_STATE,
};

const SETUP_PAGE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

/// How one boot ended; the supervisor loop in `run` decides what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootExit {
    Restart,
    Shutdown,
}

struct HostEnv {
    data_dir: PathBuf,
    http_port: u16,
    scan_file: Option<PathBuf>,
}

#[derive(Clone)]
struct ControlState {
    controller: Arc<MuxController<LoggedLines>>,
    publisher: StatePublisher,
}

#[derive(Clone)]
struct StatePublisher {
    mqtt: Option<AsyncClient>,
    last: Arc<Mutex<Option<OutputLineSet>>>,
}

#[derive(Clone)]
struct SetupState {
    session: Arc<ProvisioningSession>,
    store: Arc<Mutex<CredentialStore<JsonFileStore>>>,
    restart: Arc<Notify>,
}

/// In-memory stand-in for the EN/SEL1/SEL2 GPIOs.
#[derive(Debug, Default)]
struct LoggedLines {
    levels: OutputLineSet,
}

/// NVS stand-in: `{ "<namespace>": { "<key>": "<value>" } }` in one JSON file.
#[derive(Debug, Clone)]
struct JsonFileStore {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ScanRecord {
    ssid: String,
    #[serde(alias = "signalStrength")]
    rssi: i8,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let env = HostEnv::from_env();
    let mut boot_count = 0_u32;

    loop {
        boot_count += 1;
        info!(
            boot = boot_count,
            data_dir = %env.data_dir.display(),
            "starting hdmi-mux controller"
        );

        match boot(&env).await? {
            BootExit::Restart => info!("restart requested; re-running bootstrap"),
            BootExit::Shutdown => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn boot(env: &HostEnv) -> anyhow::Result<BootExit> {
    let mut config = env.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    let (plan, store) = select_boot_plan(env.credential_store()).await?;
    advertise_name_service(&config.device, plan.mode());

    match plan {
        BootPlan::Connected(credential) => run_connected(env, config, credential).await,
        BootPlan::Provisioning { reason } => {
            warn!(
                reason = reason.as_str(),
                "no usable wifi credentials; entering provisioning mode"
            );
            run_provisioning(env, config, store).await
        }
    }
}

async fn run_connected(
    env: &HostEnv,
    config: RuntimeConfig,
    credential: NetworkCredential,
) -> anyhow::Result<BootExit> {
    info!(
        ssid = credential.ssid(),
        "joining stored network (host uses the OS network stack)"
    );

    let mut driver = MuxDriver::new(LoggedLines::default());
    driver.init().unwrap_or_else(|never| match never {});
    let controller = Arc::new(MuxController::new(
        config.mux.variant,
        config.mux.apply_policy,
        driver,
    ));
    info!(
        variant = ?config.mux.variant,
        policy = ?config.mux.apply_policy,
        "mux outputs initialized low"
    );

    let (mqtt, eventloop) = if config.mqtt.enabled {
        let (client, eventloop) = create_mqtt_client(&config.mqtt);
        (Some(client), Some(eventloop))
    } else {
        info!("mqtt disabled; http is the only command transport");
        (None, None)
    };

    let state = ControlState {
        controller,
        publisher: StatePublisher::new(mqtt),
    };
    state.publisher.publish_if_changed(&state.controller).await;

    let mut tasks = Vec::new();
    if let Some(eventloop) = eventloop {
        tasks.push(spawn_mqtt_loop(
            state.clone(),
            config.mqtt.command_topic.clone(),
            eventloop,
        ));
    }
    if config.mux.apply_policy == ApplyPolicy::Periodic {
        tasks.push(spawn_enforcement_loop(
            state.clone(),
            Duration::from_millis(config.mux.enforcement_period_ms),
        ));
    }

    let listener = bind(env.http_port).await?;
    info!("control portal listening on http://{}", listener.local_addr()?);
    let exit = serve_until_exit(listener, control_router(state), None).await;

    for task in tasks {
        task.abort();
    }
    exit
}

async fn run_provisioning(
    env: &HostEnv,
    config: RuntimeConfig,
    store: CredentialStore<JsonFileStore>,
) -> anyhow::Result<BootExit> {
    let scan = load_scan(env.scan_file.as_deref()).await;
    if let Err(err) = &scan {
        warn!("network scan failed: {err:#}");
    }
    let session = ProvisioningSession::from_scan(scan);
    info!(networks = session.networks().len(), "network scan complete");

    info!(
        ssid = %config.device.setup_ap_ssid,
        channel = config.device.setup_ap_channel,
        max_stations = config.device.setup_ap_max_connections,
        "open setup access point simulated on host"
    );

    let restart = Arc::new(Notify::new());
    let state = SetupState {
        session: Arc::new(session),
        store: Arc::new(Mutex::new(store)),
        restart: restart.clone(),
    };

    let listener = bind(env.http_port).await?;
    info!("setup portal listening on http://{}", listener.local_addr()?);
    serve_until_exit(listener, setup_router(state), Some(restart)).await
}

/// Reads the stored credentials on the blocking pool and picks the boot mode.
async fn select_boot_plan(
    store: CredentialStore<JsonFileStore>,
) -> anyhow::Result<(BootPlan, CredentialStore<JsonFileStore>)> {
    tokio::task::spawn_blocking(move || {
        let loaded = store
            .load()
            .inspect_err(|err| warn!("credential store unavailable: {err}"));
        (BootPlan::select(loaded), store)
    })
    .await
    .context("credential load task failed")
}

fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/", get(handle_control_page))
        .route("/set", get(handle_set))
        .route("/api/status", get(handle_get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn setup_router(state: SetupState) -> Router {
    let mut router = Router::new().route("/save", get(handle_save));
    for path in SETUP_PAGE_PATHS {
        router = router.route(path, get(handle_setup_page));
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http server at {addr}"))
}

/// Serves until a restart is requested, ctrl-c arrives, or the server fails.
async fn serve_until_exit(
    listener: TcpListener,
    app: Router,
    restart: Option<Arc<Notify>>,
) -> anyhow::Result<BootExit> {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let exit = tokio::select! {
        joined = &mut server => {
            joined.context("http server task failed")??;
            return Ok(BootExit::Shutdown);
        }
        _ = restart_requested(restart) => BootExit::Restart,
        _ = tokio::signal::ctrl_c() => BootExit::Shutdown,
    };

    let _ = stop_tx.send(());
    server.await.context("http server task failed")??;
    Ok(exit)
}

async fn restart_requested(restart: Option<Arc<Notify>>) {
    match restart {
        Some(restart) => restart.notified().await,
        None => std::future::pending().await,
    }
}

fn create_mqtt_client(mqtt: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(30));
    if !mqtt.username.is_empty() {
        options.set_credentials(mqtt.username.clone(), mqtt.password.clone());
    }

    info!(host = %mqtt.host, port = mqtt.port, "mqtt client configured");
    AsyncClient::new(options, 16)
}

fn spawn_mqtt_loop(
    state: ControlState,
    command_topic: String,
    mut eventloop: EventLoop,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected; subscribing to `{command_topic}`");
                    if let Some(client) = &state.publisher.mqtt {
                        if let Err(err) = client.try_subscribe(&command_topic, QoS::AtMostOnce) {
                            warn!("mqtt subscribe failed: {err}");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.topic == command_topic {
                        handle_command(&state, "mqtt", &message.payload).await;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

fn spawn_enforcement_loop(state: ControlState, period: Duration) -> JoinHandle<()> {
    info!(period_ms = period.as_millis() as u64, "enforcement loop started");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let lines = state
                .controller
                .enforce()
                .unwrap_or_else(|never| match never {});
            debug!(lines = ?lines.as_tuple(), "enforcement cycle");
            state.publisher.publish_if_changed(&state.controller).await;
        }
    })
}

async fn handle_command(state: &ControlState, transport: &'static str, raw: &[u8]) -> MuxState {
    let mux_state = state
        .controller
        .submit(raw, monotonic_ms())
        .unwrap_or_else(|never| match never {});
    info!(
        transport,
        raw = %command_preview(raw),
        state = mux_state.token(),
        "mux command received"
    );

    if state.controller.policy() == ApplyPolicy::Immediate {
        state.publisher.publish_if_changed(&state.controller).await;
    }
    mux_state
}

async fn handle_control_page(State(state): State<ControlState>) -> Html<String> {
    Html(render_control_page(
        state.controller.applied_state(),
        state.controller.variant(),
    ))
}

async fn handle_set(State(state): State<ControlState>, uri: Uri) -> Response {
    let token = query_param(&uri.to_string(), "state").unwrap_or_default();
    handle_command(&state, "http", token.as_bytes()).await;
    (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response()
}

async fn handle_get_status(State(state): State<ControlState>) -> Json<MuxStatusPayload> {
    Json(state.controller.status(monotonic_ms()))
}

async fn handle_setup_page(State(state): State<SetupState>) -> Html<String> {
    Html(render_setup_page(state.session.networks()))
}

async fn handle_save(State(state): State<SetupState>, uri: Uri) -> Response {
    let uri = uri.to_string();
    let request = SaveRequest {
        ssid: query_param(&uri, "ssid"),
        pass: query_param(&uri, "pass"),
    };

    let mut store = state.store.clone().lock_owned().await;
    let result =
        tokio::task::spawn_blocking(move || save_credentials(&mut *store, &request)).await;

    match result {
        Ok(Ok(credential)) => {
            info!(
                ssid = credential.ssid(),
                "credentials saved; restarting in {RESTART_DELAY_MS} ms"
            );
            let restart = state.restart.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(RESTART_DELAY_MS)).await;
                restart.notify_one();
            });
            (StatusCode::OK, SAVE_ACK_BODY).into_response()
        }
        Ok(Err(SaveError::Invalid(err))) => {
            warn!("rejected submitted credentials: {err}");
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Ok(Err(SaveError::Store(err))) => {
            error!("failed to persist credentials: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist credentials",
            )
        }
        Err(err) => {
            error!("credential save task failed: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist credentials",
            )
        }
    }
}

impl HostEnv {
    fn from_env() -> Self {
        let data_dir = std::env::var("HDMI_MUX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.hdmi-mux"));

        Self {
            data_dir,
            http_port: env_parse("HDMI_MUX_HTTP_PORT").unwrap_or(8080),
            scan_file: std::env::var("HDMI_MUX_SCAN_FILE").ok().map(PathBuf::from),
        }
    }

    fn credential_store(&self) -> CredentialStore<JsonFileStore> {
        CredentialStore::new(JsonFileStore::new(self.data_dir.join("nvs.json")))
    }

    async fn load_config(&self) -> anyhow::Result<RuntimeConfig> {
        let path = self.data_dir.join("config.json");
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid config at {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(config: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Some(port) = env_parse("MQTT_PORT") {
        config.mqtt.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.mqtt.username = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        config.mqtt.password = pass;
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

async fn load_scan(path: Option<&Path>) -> anyhow::Result<Vec<ScannedNetwork>> {
    let Some(path) = path else {
        info!("HDMI_MUX_SCAN_FILE not set; scan found no networks");
        return Ok(Vec::new());
    };

    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read scan file {}", path.display()))?;
    let records: Vec<ScanRecord> = serde_json::from_slice(&raw).context("invalid scan file")?;
    Ok(records
        .into_iter()
        .map(|record| ScannedNetwork::new(record.ssid, record.rssi))
        .collect())
}

fn advertise_name_service(device: &DeviceConfig, mode: BootstrapMode) {
    info!(
        hostname = %device.hostname,
        instance = %device.instance_name,
        service = %device.service_instance,
        port = device.http_port,
        mode = mode.as_str(),
        "mdns _http._tcp advertisement is not available on host"
    );
}

impl StatePublisher {
    fn new(mqtt: Option<AsyncClient>) -> Self {
        Self {
            mqtt,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Publishes the retained status when the applied lines differ from the last publish.
    async fn publish_if_changed(&self, controller: &MuxController<LoggedLines>) {
        let Some(applied) = controller.applied() else {
            return;
        };

        {
            let mut last = self.last.lock().await;
            if *last == Some(applied) {
                return;
            }
            *last = Some(applied);
        }

        let Some(mqtt) = &self.mqtt else {
            return;
        };

        match serde_json::to_vec(&controller.status(monotonic_ms())) {
            Ok(body) => {
                // try_publish: this also runs on the event loop task, which must never block on its own queue.
                if let Err(err) = mqtt.try_publish(TOPIC_MUX_STATE, QoS::AtLeastOnce, true, body) {
                    warn!("mux state publish failed: {err}");
                }
            }
            Err(err) => warn!("mux state serialization failed: {err}"),
        }
    }
}

impl OutputLines for LoggedLines {
    type Error = Infallible;

    fn set_level(&mut self, line: Line, high: bool) -> Result<(), Infallible> {
        match line {
            Line::Enable => self.levels.enable = high,
            Line::Select1 => self.levels.select1 = high,
            Line::Select2 => self.levels.select2 = high,
        }
        debug!(
            line = line.as_str(),
            high,
            levels = ?self.levels.as_tuple(),
            "output line write"
        );
        Ok(())
    }
}

impl JsonFileStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_document(&self) -> Result<Map<String, Value>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => match serde_json::from_slice::<Value>(&raw).map_err(StoreError::backend)? {
                Value::Object(document) => Ok(document),
                _ => Err(StoreError::backend(format!(
                    "{} is not a JSON object",
                    self.path.display()
                ))),
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(StoreError::backend(err)),
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError> {
        let document = self.read_document()?;
        match document.get(STORE_NAMESPACE).and_then(|namespace| namespace.get(key)) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::InvalidValue { key }),
        }
    }

    fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError> {
        let mut document = self.read_document()?;
        let namespace = document
            .entry(STORE_NAMESPACE)
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(namespace) = namespace else {
            return Err(StoreError::backend(format!(
                "namespace `{STORE_NAMESPACE}` is not a JSON object"
            )));
        };
        namespace.insert(key.to_string(), Value::String(value.to_string()));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
        }
        let payload = serde_json::to_vec_pretty(&document).map_err(StoreError::backend)?;
        std::fs::write(&self.path, payload).map_err(StoreError::backend)
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use hdmi_mux_common::{
        enforcement::DEFAULT_ENFORCEMENT_PERIOD_MS,
        store::{KEY_WIFI_PASS, KEY_WIFI_SSID},
        MuxVariant,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hdmi-mux-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn control_state(policy: ApplyPolicy) -> ControlState {
        let mut driver = MuxDriver::new(LoggedLines::default());
        driver.init().unwrap();
        ControlState {
            controller: Arc::new(MuxController::new(MuxVariant::Basic, policy, driver)),
            publisher: StatePublisher::new(None),
        }
    }

    fn setup_state(store_path: PathBuf, networks: Vec<ScannedNetwork>) -> SetupState {
        SetupState {
            session: Arc::new(ProvisioningSession::from_scan(Ok::<_, Infallible>(networks))),
            store: Arc::new(Mutex::new(CredentialStore::new(JsonFileStore::new(
                store_path,
            )))),
            restart: Arc::new(Notify::new()),
        }
    }

    fn uri(raw: &'static str) -> Uri {
        Uri::from_static(raw)
    }

    fn location(response: &Response) -> Option<&str> {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    #[tokio::test]
    async fn set_redirects_home_and_applies_immediately() {
        let state = control_state(ApplyPolicy::Immediate);

        let response = handle_set(State(state.clone()), uri("/set?state=A")).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), Some("/"));
        assert_eq!(
            state.controller.applied().map(OutputLineSet::as_tuple),
            Some((1, 1, 0))
        );
    }

    #[tokio::test]
    async fn garbage_or_missing_state_disables_output() {
        let state = control_state(ApplyPolicy::Immediate);
        handle_set(State(state.clone()), uri("/set?state=B")).await;
        assert_eq!(
            state.controller.applied().map(OutputLineSet::as_tuple),
            Some((1, 1, 1))
        );

        handle_set(State(state.clone()), uri("/set?state=garbage")).await;
        assert_eq!(
            state.controller.applied().map(OutputLineSet::as_tuple),
            Some((0, 0, 0))
        );

        handle_set(State(state.clone()), uri("/set?state=A")).await;
        handle_set(State(state.clone()), uri("/set")).await;
        assert_eq!(state.controller.cell().get(), MuxState::Disabled);
    }

    #[tokio::test]
    async fn periodic_policy_waits_for_enforcement_cycle() {
        let state = control_state(ApplyPolicy::Periodic);

        handle_command(&state, "mqtt", b"A").await;
        assert_eq!(
            state.controller.applied().map(OutputLineSet::as_tuple),
            Some((0, 0, 0))
        );

        let lines = state.controller.enforce().unwrap();
        assert_eq!(lines.as_tuple(), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn enforcement_loop_applies_cell_once_per_period() {
        let state = control_state(ApplyPolicy::Periodic);
        let period = Duration::from_millis(DEFAULT_ENFORCEMENT_PERIOD_MS);
        let tick = Duration::from_millis(1);
        let lines = |state: &ControlState| state.controller.applied().map(OutputLineSet::as_tuple);

        let task = spawn_enforcement_loop(state.clone(), period);
        // The first cycle runs as soon as the task starts.
        tokio::time::sleep(tick).await;

        handle_command(&state, "mqtt", b"A").await;
        tokio::time::sleep(period - tick * 2).await;
        assert_eq!(lines(&state), Some((0, 0, 0)));

        tokio::time::sleep(tick * 2).await;
        assert_eq!(lines(&state), Some((1, 1, 0)));
        assert_eq!(
            *state.publisher.last.lock().await,
            Some(MuxState::PathAAll.lines())
        );

        handle_command(&state, "mqtt", b"garbage").await;
        assert_eq!(lines(&state), Some((1, 1, 0)));
        tokio::time::sleep(period).await;
        assert_eq!(lines(&state), Some((0, 0, 0)));
        assert_eq!(
            *state.publisher.last.lock().await,
            Some(MuxState::Disabled.lines())
        );

        task.abort();
    }

    #[tokio::test]
    async fn set_uses_first_state_parameter() {
        let state = control_state(ApplyPolicy::Immediate);

        handle_set(State(state.clone()), uri("/set?state=A&state=B")).await;

        assert_eq!(state.controller.cell().get(), MuxState::PathAAll);
        assert_eq!(
            state.controller.applied().map(OutputLineSet::as_tuple),
            Some((1, 1, 0))
        );
    }

    #[tokio::test]
    async fn control_page_shows_applied_state_under_periodic_policy() {
        let state = control_state(ApplyPolicy::Periodic);
        handle_command(&state, "http", b"A").await;

        let Html(page) = handle_control_page(State(state.clone())).await;
        assert!(page.contains("Current State: <strong>OFF</strong>"));

        state.controller.enforce().unwrap();
        let Html(page) = handle_control_page(State(state)).await;
        assert!(page.contains("Current State: <strong>A</strong>"));
    }

    #[tokio::test]
    async fn status_reports_last_command() {
        let state = control_state(ApplyPolicy::Immediate);
        handle_command(&state, "mqtt", b"B").await;

        let Json(status) = handle_get_status(State(state)).await;

        assert_eq!(status.state, "B");
        assert_eq!(status.last_command, "B");
        assert_eq!(status.mode, "CONNECTED");
        assert!(status.enable && status.select1 && status.select2);
    }

    #[tokio::test]
    async fn control_page_reflects_current_state() {
        let state = control_state(ApplyPolicy::Immediate);
        handle_command(&state, "http", b"A").await;

        let Html(page) = handle_control_page(State(state)).await;

        assert!(page.contains("Current State: <strong>A</strong>"));
    }

    #[tokio::test]
    async fn save_persists_credentials_and_requests_restart() {
        let dir = test_dir("save");
        let store_path = dir.join("nvs.json");
        let state = setup_state(store_path.clone(), Vec::new());
        let restart = state.restart.clone();

        let response = handle_save(
            State(state),
            uri("/save?ssid=Home&pass=secret"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], SAVE_ACK_BODY.as_bytes());

        let reloaded = JsonFileStore::new(store_path);
        assert_eq!(reloaded.get_str(KEY_WIFI_SSID).unwrap().as_deref(), Some("Home"));
        assert_eq!(reloaded.get_str(KEY_WIFI_PASS).unwrap().as_deref(), Some("secret"));
        let plan = BootPlan::select(CredentialStore::new(reloaded).load());
        assert_eq!(plan.mode(), BootstrapMode::Connected);

        tokio::time::timeout(Duration::from_secs(5), restart.notified())
            .await
            .expect("restart was not requested");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn save_uses_first_value_of_repeated_fields() {
        let dir = test_dir("repeated");
        let store_path = dir.join("nvs.json");
        let state = setup_state(store_path.clone(), Vec::new());

        let response = handle_save(
            State(state),
            uri("/save?ssid=Home&ssid=Other&pass=secret&pass=wrong"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let reloaded = JsonFileStore::new(store_path);
        assert_eq!(reloaded.get_str(KEY_WIFI_SSID).unwrap().as_deref(), Some("Home"));
        assert_eq!(reloaded.get_str(KEY_WIFI_PASS).unwrap().as_deref(), Some("secret"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn boot_plan_follows_stored_credentials() {
        let dir = test_dir("boot");
        let store_path = dir.join("nvs.json");

        let (plan, mut store) =
            select_boot_plan(CredentialStore::new(JsonFileStore::new(store_path.clone())))
                .await
                .unwrap();
        assert_eq!(plan.mode(), BootstrapMode::Provisioning);

        store
            .save(&NetworkCredential::new("Home", "secret").unwrap())
            .unwrap();
        let (plan, _) = select_boot_plan(store).await.unwrap();
        assert_eq!(plan.mode(), BootstrapMode::Connected);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn save_without_password_is_rejected_without_writing() {
        let dir = test_dir("reject");
        let store_path = dir.join("nvs.json");
        let state = setup_state(store_path.clone(), Vec::new());

        let response = handle_save(State(state), uri("/save?ssid=Home")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!store_path.exists());
    }

    #[tokio::test]
    async fn save_store_failure_returns_server_error() {
        let dir = test_dir("broken");
        std::fs::create_dir_all(&dir).unwrap();
        // A directory where the store file should be makes every read fail.
        let state = setup_state(dir.clone(), Vec::new());

        let response = handle_save(
            State(state),
            uri("/save?ssid=Home&pass=secret"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn setup_page_lists_scan_results() {
        let networks = vec![
            ScannedNetwork::new("Home", -45),
            ScannedNetwork::new("", -50),
            ScannedNetwork::new("Office", -70),
        ];
        let state = setup_state(test_dir("page").join("nvs.json"), networks);

        let Html(page) = handle_setup_page(State(state)).await;

        assert!(page.contains("Home (-45 dBm)"));
        assert!(page.contains("Office (-70 dBm)"));
        assert_eq!(page.matches("<option").count(), 2);
    }

    #[tokio::test]
    async fn scan_file_is_loaded_in_order() {
        let dir = test_dir("scan");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scan.json");
        std::fs::write(
            &path,
            r#"[{"ssid":"Home","rssi":-40},{"ssid":"Cafe","signalStrength":-81}]"#,
        )
        .unwrap();

        let networks = load_scan(Some(path.as_path())).await.unwrap();

        assert_eq!(
            networks,
            vec![ScannedNetwork::new("Home", -40), ScannedNetwork::new("Cafe", -81)]
        );
        assert!(load_scan(None).await.unwrap().is_empty());
        assert!(load_scan(Some(dir.join("missing.json").as_path()))
            .await
            .is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn json_store_rejects_non_string_values() {
        let dir = test_dir("invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nvs.json");
        std::fs::write(&path, r#"{"storage":{"wifi_ssid":5,"wifi_pass":null}}"#).unwrap();

        let store = JsonFileStore::new(path);

        assert_eq!(
            store.get_str(KEY_WIFI_SSID),
            Err(StoreError::InvalidValue { key: KEY_WIFI_SSID })
        );
        assert_eq!(store.get_str(KEY_WIFI_PASS), Ok(None));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn json_store_keeps_other_namespaces() {
        let dir = test_dir("namespaces");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("nvs.json");
        std::fs::write(&path, r#"{"other":{"key":"value"}}"#).unwrap();

        let mut store = JsonFileStore::new(path.clone());
        store.set_str(KEY_WIFI_SSID, "Home").unwrap();

        let document: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(document["other"]["key"], "value");
        assert_eq!(document["storage"]["wifi_ssid"], "Home");
        let _ = std::fs::remove_dir_all(dir);
    }
}
