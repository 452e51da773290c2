use clap::{App, AppSettings, Arg};
use futures::future;
use nix::sys::signal;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::sync::mpsc::Sender;

use conn_platform::runtime;
use conn_platform::sim::SimPlatform;
use connstack::{
    bt_mediator::BtMediator,
    cell_mediator::CellMediator,
    companion_proxy::ProxyStatus,
    companion_tracker::CompanionTracker,
    config::Config,
    controller::ConnectivityController,
    logging::Logging,
    network_agent::ProxyNetworkAgent,
    off_body_tracker::OffBodyTracker,
    power_tracker::PowerTracker,
    wifi_mediator::WifiMediator,
    get_adapter_dispatcher, get_connectivity_dispatcher, get_device_state_dispatcher,
    get_settings_dispatcher, get_sysproxy_dispatcher, get_telephony_dispatcher,
    get_wifi_dispatcher, Message, Supervisor,
};

const CONFIG_FILE_PATH: &str = "/etc/wearconnd/config.json";

/// Extra time for in-flight teardown before the process exits on SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(1000);

const INIT_LOGGING_MAX_RETRY: u8 = 3;

/// Runs the wearable connectivity supervisor daemon.
fn main() -> Result<(), Box<dyn Error>> {
    let matches = App::new("Wearable Connectivity Supervisor")
        .setting(AppSettings::TrailingVarArg)
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .takes_value(true)
                .help("Path to the tunables file"),
        )
        .arg(Arg::with_name("debug").long("debug").short("d").help("Enables debug level logs"))
        .arg(
            Arg::with_name("log-output")
                .long("log-output")
                .takes_value(true)
                .possible_values(&["syslog", "stderr"])
                .default_value("syslog")
                .help("Select log output"),
        )
        .get_matches();

    let is_debug = matches.is_present("debug");
    let log_output = matches.value_of("log-output").unwrap_or("syslog");
    let config_path = matches.value_of("config").unwrap_or(CONFIG_FILE_PATH);

    let logging = Arc::new(Mutex::new(Box::new(Logging::new(is_debug, log_output))));
    // Connecting to the syslog socket can fail while the system is still
    // coming up; retry a few times and fall through if it keeps failing.
    for _ in 0..INIT_LOGGING_MAX_RETRY {
        match logging.lock().unwrap().initialize() {
            Ok(_) => break,
            Err(_) => continue,
        }
    }

    let config = Config::load(config_path);

    let (tx, rx) = Supervisor::create_channel();

    // Dedicated single-threaded workers: radio changes block until the
    // driver settles, and running them on one thread applies decisions in
    // order. The proxy worker takes the shard's blocking socket and native
    // bridge calls.
    let bt_worker = Arc::new(
        Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("bt-worker")
            .enable_all()
            .build()
            .expect("Failed to make BT worker runtime."),
    );
    let cell_worker = Arc::new(
        Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("cell-worker")
            .enable_all()
            .build()
            .expect("Failed to make cell worker runtime."),
    );
    let proxy_worker = Arc::new(
        Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(2)
            .thread_name("proxy-worker")
            .enable_all()
            .build()
            .expect("Failed to make proxy worker runtime."),
    );

    // Development backend; real driver bindings are provided by the target
    // platform build.
    let platform = SimPlatform::new();

    runtime::get_runtime().block_on(async {
        // Install signal handlers: SIGTERM requests orderly shutdown,
        // SIGUSR1 a diagnostic dump.
        *SIG_DATA.lock().unwrap() = Some(tx.clone());
        let sig_action_term = signal::SigAction::new(
            signal::SigHandler::Handler(handle_sigterm),
            signal::SaFlags::empty(),
            signal::SigSet::empty(),
        );
        let sig_action_usr1 = signal::SigAction::new(
            signal::SigHandler::Handler(handle_sigusr1),
            signal::SaFlags::empty(),
            signal::SigSet::empty(),
        );
        unsafe {
            signal::sigaction(signal::SIGTERM, &sig_action_term).unwrap();
            signal::sigaction(signal::SIGUSR1, &sig_action_usr1).unwrap();
        }

        // Construct the stack components.
        let proxy_status = Arc::new(ProxyStatus::new());
        let network_agent = Arc::new(Mutex::new(Box::new(ProxyNetworkAgent::new(
            Arc::new(platform.clone()),
            config.proxy_score_classic,
        ))));
        let bt_mediator = Arc::new(Mutex::new(Box::new(BtMediator::new(
            tx.clone(),
            bt_worker,
            proxy_worker,
            Arc::new(platform.clone()),
            Arc::new(platform.clone()),
            network_agent.clone(),
            proxy_status.clone(),
            config.clone(),
        ))));
        let wifi_mediator =
            Arc::new(Mutex::new(Box::new(WifiMediator::new(Arc::new(platform.clone())))));
        let cell_mediator = Arc::new(Mutex::new(Box::new(CellMediator::new(
            Arc::new(platform.clone()),
            cell_worker,
            config.clone(),
        ))));
        let controller = Arc::new(Mutex::new(Box::new(ConnectivityController::new(
            tx.clone(),
            bt_mediator.clone(),
            wifi_mediator.clone(),
            cell_mediator.clone(),
            Arc::new(platform.clone()),
            proxy_status.clone(),
            config.clone(),
        ))));
        let companion_tracker =
            Arc::new(Mutex::new(Box::new(CompanionTracker::new(tx.clone()))));
        let power_tracker = Arc::new(Mutex::new(Box::new(PowerTracker::new(tx.clone()))));
        let off_body_tracker =
            Arc::new(Mutex::new(Box::new(OffBodyTracker::new(tx.clone()))));

        // Hook platform callbacks into the dispatch channel.
        platform.set_adapter_dispatcher(get_adapter_dispatcher(tx.clone()));
        platform.set_telephony_dispatcher(get_telephony_dispatcher(tx.clone()));
        platform.set_wifi_dispatcher(get_wifi_dispatcher(tx.clone()));
        platform.set_sysproxy_dispatcher(get_sysproxy_dispatcher(tx.clone()));
        platform.set_connectivity_dispatcher(get_connectivity_dispatcher(tx.clone()));
        platform.set_device_state_dispatcher(get_device_state_dispatcher(tx.clone()));
        platform.set_settings_dispatcher(get_settings_dispatcher(tx.clone()));

        // Run the supervisor main dispatch loop.
        runtime::get_runtime().spawn(Supervisor::dispatch(
            rx,
            controller.clone(),
            companion_tracker.clone(),
            power_tracker.clone(),
            off_body_tracker.clone(),
            bt_mediator.clone(),
            wifi_mediator.clone(),
            cell_mediator.clone(),
            network_agent.clone(),
        ));

        // Kick the boot sequence.
        let txl = tx.clone();
        tokio::spawn(async move {
            let _ = txl.send(Message::BootCompleted).await;
        });

        // Serve forever.
        future::pending::<()>().await;
        unreachable!()
    })
}

/// Data needed for signal handling.
static SIG_DATA: Mutex<Option<Sender<Message>>> = Mutex::new(None);

extern "C" fn handle_sigterm(_signum: i32) {
    let guard = SIG_DATA.lock().unwrap();
    if let Some(tx) = guard.as_ref() {
        log::debug!("Handling SIGTERM by shutting the supervisor down");
        let txl = tx.clone();
        runtime::get_runtime().spawn(async move {
            let _ = txl.send(Message::Shutdown).await;
        });
        // Give the teardown a moment before the process goes away.
        std::thread::sleep(SHUTDOWN_GRACE);
    }

    log::debug!("Sigterm completed");
    std::process::exit(0);
}

extern "C" fn handle_sigusr1(_signum: i32) {
    let guard = SIG_DATA.lock().unwrap();
    if let Some(tx) = guard.as_ref() {
        let txl = tx.clone();
        runtime::get_runtime().spawn(async move {
            let _ = txl.send(Message::Dump).await;
        });
    }
}
