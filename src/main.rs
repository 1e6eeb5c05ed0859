use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

use tunguard::cli::{Cli, Command, ReplayArgs};
use tunguard::config::GuardConfig;
use tunguard::error::GuardError;
use tunguard::output;
use tunguard::pcap;
use tunguard::replay::{self, ReplayOptions};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
/// Set on SIGHUP; the attach loop re-reads the configuration file.
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn is_reload_signal(sig: libc::c_int) -> bool {
    sig == libc::SIGHUP
}

#[cfg(not(unix))]
fn is_reload_signal(_sig: libc::c_int) -> bool {
    false
}

extern "C" fn signal_handler(sig: libc::c_int) {
    if is_reload_signal(sig) {
        RELOAD_REQUESTED.store(true, Ordering::Relaxed);
    } else {
        SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
    }
}

fn install_signal_handlers() {
    #[cfg(unix)]
    let signals = [libc::SIGTERM, libc::SIGINT, libc::SIGHUP];
    #[cfg(not(unix))]
    let signals = [libc::SIGTERM, libc::SIGINT];
    for sig in signals {
        unsafe {
            libc::signal(sig, signal_handler as *const () as libc::sighandler_t);
        }
    }
}

fn exit_code(err: &GuardError) -> i32 {
    match err {
        GuardError::Config(_) => 2,
        GuardError::Pcap(_) => 3,
        GuardError::DeviceIo(_) => 4,
        _ => 5,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli)));

    match result {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(e)) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
        Err(_) => {
            eprintln!("error: fatal: unexpected panic");
            std::process::exit(5);
        }
    }
}

fn run(cli: Cli) -> Result<(), GuardError> {
    let mut config = GuardConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Replay(args) => {
            args.policy.apply(&mut config);
            run_replay(&args, &config)
        }
        Command::Attach(args) => {
            args.policy.apply(&mut config);
            install_signal_handlers();
            attach::run(&args, &config, cli.config.as_deref())
        }
    }
}

fn run_replay(args: &ReplayArgs, config: &GuardConfig) -> Result<(), GuardError> {
    let packets = pcap::read_packets(&args.pcap)?;
    log::info!("loaded {} packets from {}", packets.len(), args.pcap.display());

    let opts = ReplayOptions {
        direction: args.direction,
        batch: args.batch,
        offset: args.offset,
    };
    let report = replay::replay(&packets, config, opts)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    output::write_report(&report, args.format, &mut out)?;
    out.flush().map_err(GuardError::Serialization)
}

#[cfg(unix)]
mod attach {
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::{Duration, Instant};

    use tunguard::cli::AttachArgs;
    use tunguard::config::GuardConfig;
    use tunguard::diag::LogDiagnostics;
    use tunguard::error::GuardError;
    use tunguard::guard::GuardedTun;
    use tunguard::oracle::rules::RuleAdmissionOracle;
    use tunguard::pcap::PcapWriter;
    use tunguard::recorder::ChannelRecorder;
    use tunguard::relay;
    use tunguard::tun::TunDevice;
    use tunguard::tun::fd::FdTun;

    use super::{RELOAD_REQUESTED, SHUTDOWN_REQUESTED};

    const STATS_INTERVAL: Duration = Duration::from_secs(10);
    const TICK: Duration = Duration::from_millis(250);

    /// Relay packets between the tunnel and the host side through the guard
    /// until a signal arrives or either descriptor fails.
    pub fn run(
        args: &AttachArgs,
        config: &GuardConfig,
        config_path: Option<&Path>,
    ) -> Result<(), GuardError> {
        // SAFETY: the parent process hands over `--fd` and `--peer-fd` as
        // open descriptors that nothing else in this process owns.
        let (tun_fd, peer_fd) = unsafe {
            (
                OwnedFd::from_raw_fd(args.fd),
                OwnedFd::from_raw_fd(args.peer_fd),
            )
        };
        let tun = FdTun::new(tun_fd, args.name.clone(), args.mtu);
        let peer = FdTun::new(peer_fd, format!("{}-peer", args.name), args.mtu);

        let rules = config.rule_oracle();
        let recorder = ChannelRecorder::spawn(config.recorder_queue, |domain| {
            log::info!("malware block: {domain}");
        })?;
        let mut guard = GuardedTun::new(tun)
            .with_admission(config.wrap_admission(Arc::clone(&rules))?)
            .with_malware(config.malware_oracle()?)
            .with_recorder(Arc::new(recorder))
            .with_diagnostics(Arc::new(LogDiagnostics::new(&config.log_tag)));
        if let Some(path) = &config.pcap_path {
            guard = guard.with_capture(PcapWriter::create(path)?);
        }
        let mtu = guard.mtu().map_err(GuardError::DeviceIo)?;

        log::info!("guarding {} (mtu {mtu})", args.name);
        let (inbound, outbound) = thread::scope(|s| {
            let inbound =
                s.spawn(|| relay::run_until("inbound", &guard, &peer, mtu, &SHUTDOWN_REQUESTED));
            let outbound =
                s.spawn(|| relay::run_until("outbound", &peer, &guard, mtu, &SHUTDOWN_REQUESTED));
            supervise(args, &guard, &rules, config_path);
            (join(inbound), join(outbound))
        });

        log::info!("shutdown requested");
        let closed = guard.close().map_err(GuardError::DeviceIo);
        let _ = peer.close();
        inbound?;
        outbound?;
        closed
    }

    fn join(handle: thread::ScopedJoinHandle<'_, Result<(), GuardError>>) -> Result<(), GuardError> {
        handle
            .join()
            .unwrap_or_else(|_| Err(GuardError::Fatal("relay thread panicked".to_string())))
    }

    /// Periodic stats and SIGHUP rule reloads, until shutdown.
    fn supervise(
        args: &AttachArgs,
        guard: &GuardedTun<FdTun>,
        rules: &RuleAdmissionOracle,
        config_path: Option<&Path>,
    ) {
        let mut last_stats = Instant::now();
        while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            thread::sleep(TICK);
            if RELOAD_REQUESTED.swap(false, Ordering::Relaxed) {
                reload(args, rules, config_path);
            }
            if last_stats.elapsed() >= STATS_INTERVAL {
                log::info!("stats: {:?}", guard.stats());
                last_stats = Instant::now();
            }
        }
    }

    fn reload(args: &AttachArgs, rules: &RuleAdmissionOracle, config_path: Option<&Path>) {
        let Some(path) = config_path else {
            log::warn!("SIGHUP ignored: no --config file to reload");
            return;
        };
        match GuardConfig::reload_admission(path, |c| args.policy.apply(c), rules) {
            Ok(()) => log::info!("reloaded admission rules from {}", path.display()),
            Err(e) => log::warn!("reload failed, keeping current rules: {e}"),
        }
    }
}

#[cfg(not(unix))]
mod attach {
    use std::path::Path;

    use tunguard::cli::AttachArgs;
    use tunguard::config::GuardConfig;
    use tunguard::error::GuardError;

    pub fn run(
        _args: &AttachArgs,
        _config: &GuardConfig,
        _config_path: Option<&Path>,
    ) -> Result<(), GuardError> {
        Err(GuardError::Fatal(
            "attach needs a unix tunnel file descriptor".to_string(),
        ))
    }
}
