//! Daemon entry point (§6): parses flags and the config file, brings up
//! logging, the worker pool and the QUIC transport, then either runs the
//! stdin admin CLI (foreground mode) or waits on a termination signal
//! (daemon mode).

mod admin;
mod options;

use options::RuntimeOptions;
use relay_core::connection::{ConnectionTask, Role};
use relay_core::directory::ExchangeDirectory;
use relay_core::pool::{worker_count, JobList, ThreadPool};
use relay_core::store::Store;
use relay_core::transport::Transport;
use relay_proto::config::{Config, ServerRole};
use relay_proto::logging;
use signal_hook::consts::signal::{SIGABRT, SIGBUS, SIGFPE, SIGILL, SIGSEGV, SIGTERM, SIGTRAP};
use signal_hook::flag;
use backtrace::Backtrace;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/relay/relay.conf";
const HELP_TEXT: &str = "\
usage: relay-server [-daemon] [-config <path>] [-help]
  -daemon          run without the interactive admin console
  -config <path>   load configuration from <path> (default /etc/relay/relay.conf)
  -help            print this message and exit
";

fn main() {
    let options = RuntimeOptions::parse(std::env::args().skip(1));
    if options.help {
        print!("{}", HELP_TEXT);
        return;
    }

    let config_path = options.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let config = Config::load(config_path).unwrap_or_else(|e| {
        eprintln!("warning: could not read {} ({}), using defaults", config_path, e);
        Config::default()
    });

    let log = logging::init("info", None);
    slog::info!(log, "starting"; "port" => config.server_port, "role" => ?config.role);

    install_crash_handlers(log.clone());

    let role = match config.role {
        ServerRole::Connection => Role::Connection,
        ServerRole::Communication => Role::Communication,
    };

    let store_path = config.mysql_database.clone();
    if let Err(e) = Store::open(&store_path) {
        slog::error!(log, "failed to open persistence backend"; "error" => %e);
        return;
    }

    let transport = match Transport::bind(
        config.server_port,
        &config.server_cert_file_path,
        &config.server_key_file_path,
        config.server_connection_timeout_s,
        config.server_max_client_count,
    ) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            slog::error!(log, "failed to bind transport"; "error" => %e);
            return;
        }
    };

    let directory = Arc::new(ExchangeDirectory::new());
    let job_list = Arc::new(JobList::new());

    let worker_session_path = store_path.clone();
    let worker_log = log.clone();
    let pool = ThreadPool::spawn(Arc::clone(&job_list), worker_count(), move || {
        Store::open(&worker_session_path).unwrap_or_else(|e| {
            slog::error!(worker_log, "worker could not open store"; "error" => %e);
            panic!("persistence backend unavailable");
        })
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime builds");

    let accept_log = log.clone();
    let accept_job_list = Arc::clone(&job_list);
    let accept_directory = Arc::clone(&directory);
    let channel_id = config.channel_id;
    let accept_transport = Arc::clone(&transport);
    runtime.spawn(async move {
        accept_transport
            .run(accept_log.clone(), move |io| {
                let task = ConnectionTask::new(
                    io,
                    role,
                    channel_id,
                    Arc::clone(&accept_directory),
                    accept_log.clone(),
                );
                accept_job_list.add(Box::new(task));
            })
            .await;
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown)).expect("can register SIGTERM handler");

    if options.daemon {
        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
        }
    } else {
        admin::run(&store_path, &log);
    }

    slog::info!(log, "shutting down");
    pool.shutdown(&job_list);
    transport.close();
    pool.join();
}

/// Fatal signals (illegal instruction, trap, floating point exception,
/// abort, segfault, bus error) write a backtrace to disk before the
/// process dies, matching the original's crash-dump behaviour
/// (`Main.cpp`'s `SignalHandler` and `Logger::Backtrace`). A background thread
/// polls the raised flags rather than running handler code on the signal
/// stack, mirroring `signal_hook::flag`'s own safety contract.
fn install_crash_handlers(log: relay_proto::logging::Logger) {
    let crash_signals = [SIGILL, SIGTRAP, SIGFPE, SIGABRT, SIGSEGV, SIGBUS];
    let flags: Vec<(i32, Arc<AtomicBool>)> = crash_signals
        .iter()
        .map(|&signal| {
            let flag = Arc::new(AtomicBool::new(false));
            flag::register(signal, Arc::clone(&flag)).expect("can register crash handler");
            (signal, flag)
        })
        .collect();

    thread::spawn(move || loop {
        for (signal, flag) in &flags {
            if flag.load(Ordering::SeqCst) {
                let backtrace = Backtrace::new();
                let path = format!("/tmp/relay-crash-{}.txt", std::process::id());
                let _ = fs::write(&path, format!("signal {}\n{:?}", signal, backtrace));
                slog::crit!(log, "fatal signal received"; "signal" => *signal, "backtrace_file" => %path);
                std::process::exit(128 + signal);
            }
        }
        thread::sleep(Duration::from_millis(50));
    });
}
