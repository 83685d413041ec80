use std::{
    ffi::CStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    io::Write,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Level, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mdns::EspMdns,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use serde::Serialize;

use hdmi_mux_common::{
    command::command_preview,
    portal::{render_control_page, render_setup_page, SAVE_ACK_BODY},
    provisioning::{save_credentials, RESTART_DELAY_MS},
    query::query_param,
    store::STORE_NAMESPACE,
    ApplyPolicy, BootPlan, CredentialStore, DeviceConfig, ErrorBody, KeyValueStore, Line, MqttConfig,
    MuxController, MuxDriver, MuxPins, NetworkCredential, OutputLineSet, OutputLines,
    ProvisioningSession, RuntimeConfig, SaveError, SaveRequest, ScannedNetwork, StoreError,
    TOPIC_MUX_STATE,
};

const NVS_READ_BUFFER: usize = 256;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const HOUSEKEEPING_TICK_MS: u64 = 250;
const SETUP_PAGE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

type Wifi = BlockingWifi<EspWifi<'static>>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// EN/SEL1/SEL2 of the switch.
struct GpioLines {
    enable: PinDriver<'static, AnyOutputPin, Output>,
    select1: PinDriver<'static, AnyOutputPin, Output>,
    select2: PinDriver<'static, AnyOutputPin, Output>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// Owned by the housekeeping thread; the receiver thread only raises `resubscribe`.
struct MqttLink {
    client: EspMqttClient<'static>,
    topic: String,
    resubscribe: Arc<AtomicBool>,
    last_published: Option<OutputLineSet>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    log_banner();

    let mut config = RuntimeConfig::default();
    apply_build_overrides(&mut config);
    config.sanitize();

    let driver = init_mux_driver(&config.mux.pins)?;

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = CredentialStore::new(NvsStore {
        partition: nvs_partition.clone(),
    });

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;

    let plan = BootPlan::select(
        store
            .load()
            .inspect_err(|err| warn!("credential store unavailable: {err}")),
    );

    match plan {
        BootPlan::Connected(credential) => run_connected(config, wifi, driver, credential),
        BootPlan::Provisioning { reason } => {
            warn!(
                "no usable wifi credentials ({}); entering provisioning mode",
                reason.as_str()
            );
            run_provisioning(config, wifi, driver, store)
        }
    }
}

fn run_connected(
    config: RuntimeConfig,
    mut wifi: Wifi,
    driver: MuxDriver<GpioLines>,
    credential: NetworkCredential,
) -> anyhow::Result<()> {
    if let Err(err) = connect_station(&mut wifi, &credential) {
        // The housekeeping thread restarts the device if the link never comes up.
        warn!("station join failed: {err:#}");
    }

    let mdns = advertise_name_service(&config.device);
    let controller = Arc::new(MuxController::new(
        config.mux.variant,
        config.mux.apply_policy,
        driver,
    ));

    let mqtt = if config.mqtt.enabled {
        match create_mqtt_client(&config.mqtt) {
            Ok((client, conn)) => {
                let resubscribe = Arc::new(AtomicBool::new(false));
                spawn_mqtt_receiver(
                    controller.clone(),
                    config.mqtt.command_topic.clone(),
                    resubscribe.clone(),
                    conn,
                )?;
                Some(MqttLink {
                    client,
                    topic: config.mqtt.command_topic.clone(),
                    resubscribe,
                    last_published: None,
                })
            }
            Err(err) => {
                warn!("mqtt client unavailable, http is the only command transport: {err:#}");
                None
            }
        }
    } else {
        None
    };

    spawn_housekeeping(
        controller.clone(),
        mqtt,
        config.mux.apply_policy,
        config.mux.enforcement_period_ms,
    )?;

    let server = create_control_server(controller, config.device.http_port)?;
    info!("control portal listening on port {}", config.device.http_port);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let _mdns = mdns;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn run_provisioning(
    config: RuntimeConfig,
    mut wifi: Wifi,
    driver: MuxDriver<GpioLines>,
    store: CredentialStore<NvsStore>,
) -> anyhow::Result<()> {
    let scan = scan_networks(&mut wifi);
    if let Err(err) = &scan {
        warn!("network scan failed: {err:#}");
    }
    let session = ProvisioningSession::from_scan(scan);
    info!("scan complete: offering {} networks", session.networks().len());

    start_setup_ap(&mut wifi, &config.device)?;
    let mdns = advertise_name_service(&config.device);

    let server = create_setup_server(
        Arc::new(session),
        Arc::new(Mutex::new(store)),
        config.device.http_port,
    )?;
    info!("setup portal listening on port {}", config.device.http_port);

    let _wifi = wifi;
    let _server = server;
    let _mdns = mdns;
    // Lines stay driven low while the device is unconfigured.
    let _driver = driver;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn log_banner() {
    let free_heap = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() };
    let idf_version = unsafe { CStr::from_ptr(esp_idf_svc::sys::esp_get_idf_version()) };
    info!(
        "hdmi-mux firmware starting: free heap {free_heap} bytes, IDF {}",
        idf_version.to_string_lossy()
    );
}

fn apply_build_overrides(config: &mut RuntimeConfig) {
    if let Some(host) = option_env!("MQTT_HOST") {
        config.mqtt.host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|port| port.parse().ok()) {
        config.mqtt.port = port;
    }
    if let Some(user) = option_env!("MQTT_USER") {
        config.mqtt.username = user.to_string();
    }
    if let Some(pass) = option_env!("MQTT_PASS") {
        config.mqtt.password = pass.to_string();
    }
}

fn init_mux_driver(pins: &MuxPins) -> anyhow::Result<MuxDriver<GpioLines>> {
    let lines = GpioLines {
        enable: output_pin(pins.enable)?,
        select1: output_pin(pins.select1)?,
        select2: output_pin(pins.select2)?,
    };

    let mut driver = MuxDriver::new(lines);
    driver.init().context("failed to drive mux lines low")?;
    info!(
        "mux lines EN=GPIO{} SEL1=GPIO{} SEL2=GPIO{} initialized low",
        pins.enable, pins.select1, pins.select2
    );
    Ok(driver)
}

fn output_pin(pin: i32) -> anyhow::Result<PinDriver<'static, AnyOutputPin, Output>> {
    // Pin numbers are validated by `MuxConfig::sanitize` and claimed nowhere else.
    unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("failed to configure GPIO{pin} as output"))
}

impl OutputLines for GpioLines {
    type Error = EspError;

    fn set_level(&mut self, line: Line, high: bool) -> Result<(), EspError> {
        let pin = match line {
            Line::Enable => &mut self.enable,
            Line::Select1 => &mut self.select1,
            Line::Select2 => &mut self.select2,
        };
        pin.set_level(if high { Level::High } else { Level::Low })
    }
}

fn connect_station(wifi: &mut Wifi, credential: &NetworkCredential) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: credential
            .ssid()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: credential
            .passphrase()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", credential.ssid());

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    Err(match last_err {
        Some(err) => anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err}"),
        None => anyhow!("wifi connect was never attempted"),
    })
}

fn scan_networks(wifi: &mut Wifi) -> anyhow::Result<Vec<ScannedNetwork>> {
    wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
    wifi.start()?;
    let found = wifi.scan().context("wifi scan failed")?;
    wifi.stop()?;

    Ok(found
        .into_iter()
        .map(|ap| ScannedNetwork::new(ap.ssid.as_str(), ap.signal_strength))
        .collect())
}

fn start_setup_ap(wifi: &mut Wifi, device: &DeviceConfig) -> anyhow::Result<()> {
    // A failed scan may leave the station running.
    let _ = wifi.stop();

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: device
            .setup_ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("setup AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: device.setup_ap_channel,
        max_connections: device.setup_ap_max_connections,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "open setup AP `{}` started on channel {}",
        device.setup_ap_ssid, device.setup_ap_channel
    );
    Ok(())
}

fn advertise_name_service(device: &DeviceConfig) -> Option<EspMdns> {
    match start_mdns(device) {
        Ok(mdns) => {
            info!(
                "mdns: {}.local advertising `{}` (_http._tcp:{})",
                device.hostname, device.service_instance, device.http_port
            );
            Some(mdns)
        }
        Err(err) => {
            warn!("mdns advertisement unavailable: {err:#}");
            None
        }
    }
}

fn start_mdns(device: &DeviceConfig) -> anyhow::Result<EspMdns> {
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(&device.hostname)?;
    mdns.set_instance_name(&device.instance_name)?;
    mdns.add_service(
        Some(&device.service_instance),
        "_http",
        "_tcp",
        device.http_port,
        &[],
    )?;
    Ok(mdns)
}

fn http_configuration(port: u16) -> HttpConfiguration {
    HttpConfiguration {
        http_port: port,
        stack_size: 10 * 1024,
        ..Default::default()
    }
}

fn create_control_server(
    controller: Arc<MuxController<GpioLines>>,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let mut server = EspHttpServer::new(&http_configuration(port))?;

    {
        let controller = controller.clone();
        server.fn_handler("/", Method::Get, move |req| {
            let page = render_control_page(controller.applied_state(), controller.variant());
            write_html(req, &page)
        })?;
    }

    {
        let controller = controller.clone();
        server.fn_handler::<anyhow::Error, _>("/set", Method::Get, move |req| {
            let token = query_param(req.uri(), "state").unwrap_or_default();
            handle_command(&controller, "http", token.as_bytes());
            req.into_response(302, Some("Found"), &[("Location", "/")])?;
            Ok(())
        })?;
    }

    server.fn_handler("/api/status", Method::Get, move |req| {
        write_json(req, &controller.status(monotonic_ms()))
    })?;

    Ok(server)
}

fn create_setup_server(
    session: Arc<ProvisioningSession>,
    store: Arc<Mutex<CredentialStore<NvsStore>>>,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let mut server = EspHttpServer::new(&http_configuration(port))?;

    for path in SETUP_PAGE_PATHS {
        let session = session.clone();
        server.fn_handler(path, Method::Get, move |req| {
            write_html(req, &render_setup_page(session.networks()))
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/save", Method::Get, move |req| {
        let request = SaveRequest {
            ssid: query_param(req.uri(), "ssid"),
            pass: query_param(req.uri(), "pass"),
        };

        let result = {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            save_credentials(&mut *store, &request)
        };

        match result {
            Ok(credential) => {
                info!(
                    "credentials for `{}` saved; restarting in {RESTART_DELAY_MS} ms",
                    credential.ssid()
                );
                schedule_restart(Duration::from_millis(RESTART_DELAY_MS))?;
                write_text(req, SAVE_ACK_BODY)
            }
            Err(SaveError::Invalid(err)) => {
                warn!("rejected submitted credentials: {err}");
                write_error(req, 400, &err.to_string())
            }
            Err(SaveError::Store(err)) => {
                error!("failed to persist credentials: {err}");
                write_error(req, 500, "Failed to persist credentials")
            }
        }
    })?;

    Ok(server)
}

fn handle_command(controller: &MuxController<GpioLines>, transport: &str, raw: &[u8]) {
    match controller.submit(raw, monotonic_ms()) {
        Ok(state) => info!(
            "{transport} command `{}` -> {}",
            command_preview(raw),
            state.token()
        ),
        Err(err) => restart_device(&format!("mux line write failed: {err}")),
    }
}

fn create_mqtt_client(
    mqtt: &MqttConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", mqtt.host, mqtt.port);

    let conf = MqttClientConfiguration {
        client_id: Some(mqtt.client_id.as_str()),
        username: if mqtt.username.is_empty() {
            None
        } else {
            Some(mqtt.username.as_str())
        },
        password: if mqtt.password.is_empty() {
            None
        } else {
            Some(mqtt.password.as_str())
        },
        ..Default::default()
    };

    info!("mqtt client connecting to {url}");
    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    controller: Arc<MuxController<GpioLines>>,
    topic: String,
    resubscribe: Arc<AtomicBool>,
    mut conn: EspMqttConnection,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        resubscribe.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => warn!("mqtt disconnected"),
                    EventPayload::Received {
                        topic: Some(received),
                        data,
                        details,
                        ..
                    } => {
                        // Only whole payloads; a fragment would normalize to something else.
                        if matches!(details, Details::Complete) && received == topic {
                            handle_command(&controller, "mqtt", data);
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

/// Enforcement under `Periodic`, mqtt subscribe/publish, and the wifi recovery restart.
fn spawn_housekeeping(
    controller: Arc<MuxController<GpioLines>>,
    mut mqtt: Option<MqttLink>,
    policy: ApplyPolicy,
    enforcement_period_ms: u64,
) -> anyhow::Result<()> {
    if policy == ApplyPolicy::Periodic {
        info!("enforcement every {enforcement_period_ms} ms");
    }

    thread::Builder::new()
        .name("housekeeping".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut last_enforced_ms = 0_u64;
            let mut wifi_disconnected_since_ms: Option<u64> = None;

            loop {
                let now_ms = monotonic_ms();

                if is_wifi_station_connected() {
                    wifi_disconnected_since_ms = None;
                } else if let Some(disconnected_since_ms) = wifi_disconnected_since_ms {
                    if now_ms.saturating_sub(disconnected_since_ms) >= WIFI_RESTART_GRACE_MS {
                        restart_device(&format!(
                            "wifi disconnected for {}s",
                            WIFI_RESTART_GRACE_MS / 1000
                        ));
                    }
                } else {
                    wifi_disconnected_since_ms = Some(now_ms);
                }

                if policy == ApplyPolicy::Periodic
                    && now_ms.saturating_sub(last_enforced_ms) >= enforcement_period_ms
                {
                    last_enforced_ms = now_ms;
                    if let Err(err) = controller.enforce() {
                        restart_device(&format!("mux line write failed: {err}"));
                    }
                }

                if let Some(link) = mqtt.as_mut() {
                    link.service(&controller);
                }

                thread::sleep(Duration::from_millis(HOUSEKEEPING_TICK_MS));
            }
        })
        .context("failed to spawn housekeeping thread")?;
    Ok(())
}

impl MqttLink {
    fn service(&mut self, controller: &MuxController<GpioLines>) {
        if self.resubscribe.swap(false, Ordering::Relaxed) {
            match self.client.subscribe(&self.topic, QoS::AtMostOnce) {
                Ok(_) => info!("subscribed to `{}`", self.topic),
                Err(err) => {
                    warn!("mqtt subscribe failed: {err}");
                    self.resubscribe.store(true, Ordering::Relaxed);
                }
            }
        }

        let Some(applied) = controller.applied() else {
            return;
        };
        if self.last_published == Some(applied) {
            return;
        }

        let body = match serde_json::to_vec(&controller.status(monotonic_ms())) {
            Ok(body) => body,
            Err(err) => {
                warn!("mux state serialization failed: {err}");
                return;
            }
        };

        match self
            .client
            .publish(TOPIC_MUX_STATE, QoS::AtLeastOnce, true, &body)
        {
            Ok(_) => self.last_published = Some(applied),
            Err(err) => warn!("mux state publish failed: {err}"),
        }
    }
}

impl NvsStore {
    fn open(&self) -> Result<EspNvs<NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), STORE_NAMESPACE, true).map_err(StoreError::backend)
    }
}

impl KeyValueStore for NvsStore {
    fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError> {
        let nvs = self.open()?;
        let mut buffer = [0_u8; NVS_READ_BUFFER];
        nvs.get_str(key, &mut buffer)
            .map(|value| value.map(str::to_owned))
            .map_err(StoreError::backend)
    }

    fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError> {
        let mut nvs = self.open()?;
        nvs.set_str(key, value).map_err(StoreError::backend)
    }
}

fn write_html(req: HttpRequest<'_, '_>, body: &str) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_text(req: HttpRequest<'_, '_>, body: &str) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&ErrorBody::new(message))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn schedule_restart(delay: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("restart".into())
        .spawn(move || {
            thread::sleep(delay);
            restart_device("provisioning complete");
        })
        .context("failed to spawn restart thread")?;
    Ok(())
}

fn restart_device(reason: &str) {
    warn!("restarting device: {reason}");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
