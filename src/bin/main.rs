//! jailwatch CLI: run one isolated execution and stream its events

use clap::{Parser, Subcommand};
use console::style;
use jailwatch::config::ENV_SAMPLER;
use jailwatch::events::{channel, Event, EventEnvelope, StreamKind};
use jailwatch::isolation::HostPlatform;
use jailwatch::logging::init_logger;
use jailwatch::{utils, ExecutionRequest, OrchestratorBuilder, OrchestratorConfig, StartOutcome};
use nix::sys::signal::Signal;
use std::io::Write;

#[derive(Parser)]
#[command(name = "jailwatch")]
#[command(about = "Run a command in a file jail and watch what it touches", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        /// Program to run
        program: String,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Jail directory; descriptors outside it are reported
        #[arg(short, long)]
        jail: Option<String>,

        /// Run without network access
        #[arg(short = 'n', long)]
        no_network: bool,

        /// Memory limit (e.g., 100M, 1G)
        #[arg(short, long)]
        memory: Option<String>,

        /// CPU limit percentage, passed on to the host sandbox
        #[arg(short, long)]
        cpu: Option<f64>,

        /// Maximum number of processes
        #[arg(short, long)]
        procs: Option<u64>,

        /// Largest file the program may write (e.g., 10M)
        #[arg(short, long)]
        file_size: Option<String>,

        /// Sampler executable; overrides JAILWATCH_SAMPLER
        #[arg(short, long)]
        sampler: Option<String>,

        /// Print telemetry batches as they arrive
        #[arg(short, long)]
        telemetry: bool,
    },

    /// Check host capabilities
    Check,
}

struct RunOptions {
    jail: Option<String>,
    no_network: bool,
    memory: Option<String>,
    cpu: Option<f64>,
    procs: Option<u64>,
    file_size: Option<String>,
    sampler: Option<String>,
    telemetry: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Commands::Run {
            program,
            args,
            jail,
            no_network,
            memory,
            cpu,
            procs,
            file_size,
            sampler,
            telemetry,
        } => {
            let options = RunOptions {
                jail,
                no_network,
                memory,
                cpu,
                procs,
                file_size,
                sampler,
                telemetry,
            };
            match build_request(&program, &args, &options).and_then(|r| run(r, &options)) {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    eprintln!("{} {}", style("Error:").red().bold(), e);
                    std::process::exit(2);
                }
            }
        }
        Commands::Check => check_host(),
    }
}

fn build_request(
    program: &str,
    args: &[String],
    options: &RunOptions,
) -> Result<ExecutionRequest, Box<dyn std::error::Error>> {
    let mut request = ExecutionRequest::new(program, args.iter().cloned());

    if let Some(jail) = &options.jail {
        request = request.with_jail(jail.clone());
    }
    if options.no_network {
        request = request.without_network();
    }
    if let Some(memory) = &options.memory {
        let mb = utils::parse_memory_size(memory)? / (1024 * 1024);
        if mb == 0 {
            return Err(format!("Memory limit {} is below one megabyte", memory).into());
        }
        request = request.with_memory_limit_mb(mb);
    }
    if let Some(cpu) = options.cpu {
        request = request.with_cpu_limit(cpu);
    }
    if let Some(procs) = options.procs {
        request = request.with_process_limit(procs);
    }
    if let Some(size) = &options.file_size {
        request = request.with_file_size_limit(utils::parse_memory_size(size)?);
    }

    Ok(request)
}

/// Start the request and relay events until it ends; returns the exit code to use
fn run(request: ExecutionRequest, options: &RunOptions) -> Result<i32, Box<dyn std::error::Error>> {
    let config = OrchestratorConfig::from_lookup(|key| match (key, &options.sampler) {
        (ENV_SAMPLER, Some(program)) => Some(program.clone()),
        _ => std::env::var(key).ok(),
    })?;
    let (sink, events) = channel();
    let mut orchestrator = OrchestratorBuilder::from_config(config).build(sink)?;

    let run_id = match orchestrator.start(request) {
        StartOutcome::Accepted { run_id, pid } => {
            log::info!("Started {} as pid {}", run_id, pid);
            run_id
        }
        StartOutcome::Rejected { kind, reason } => {
            return Err(format!("{:?} rejection: {}", kind, reason).into());
        }
    };

    for envelope in events {
        if envelope.run_id != run_id {
            continue;
        }
        if let Some(code) = relay(&envelope, options.telemetry) {
            return Ok(code);
        }
    }

    Err("Event stream closed before the execution ended".into())
}

/// Print one event; returns the process exit code once the terminal event arrives
fn relay(envelope: &EventEnvelope, show_telemetry: bool) -> Option<i32> {
    match &envelope.event {
        Event::Output { stream, data } => {
            let written = match stream {
                StreamKind::Stdout => std::io::stdout().write_all(data),
                StreamKind::Stderr => std::io::stderr().write_all(data),
            };
            if let Err(e) = written {
                log::debug!("Failed to relay output: {}", e);
            }
            None
        }
        Event::Violation(violation) => {
            eprintln!(
                "{} pid {} opened {}",
                style("[violation]").red().bold(),
                violation.pid,
                violation.path.display()
            );
            None
        }
        Event::TelemetryBatch(batch) => {
            if show_telemetry {
                for sample in &batch.samples {
                    eprintln!("{} {}", style("[telemetry]").cyan(), sample.summary());
                }
            }
            None
        }
        Event::Anomaly(report) => {
            eprintln!(
                "{} {:?} score={:.2} label={}",
                style("[anomaly]").yellow().bold(),
                report.action,
                report.anomaly_score,
                report.label
            );
            None
        }
        Event::Exit { code, signal, .. } => {
            let _ = std::io::stdout().flush();
            Some(exit_code(*code, signal.as_deref()))
        }
        Event::Error { message } => {
            eprintln!("{} {}", style("[error]").red().bold(), message);
            Some(1)
        }
    }
}

/// Shell convention: the child's code, or 128 + signal number
fn exit_code(code: Option<i32>, signal: Option<&str>) -> i32 {
    match (code, signal) {
        (Some(code), _) => code,
        (None, Some(name)) => name
            .parse::<Signal>()
            .map(|sig| 128 + sig as i32)
            .unwrap_or(1),
        (None, None) => 1,
    }
}

fn check_host() {
    println!("[*] Checking host capabilities...");
    println!();

    let platform = HostPlatform::detect();
    if platform.is_native() {
        println!("[✓] Descriptor introspection via /proc");
    } else {
        println!("[✗] No /proc descriptor introspection; jail monitoring disabled");
    }

    match OrchestratorConfig::from_env() {
        Ok(config) => {
            if config.network.is_available() {
                println!("[✓] Network wrapper: {}", config.network.wrapper().join(" "));
            } else {
                println!(
                    "[✗] Network wrapper not found: {}",
                    config.network.wrapper().join(" ")
                );
            }
            match &config.sampler {
                Some(sampler) => println!("[✓] Sampler: {}", sampler.program.display()),
                None => println!("[-] No sampler configured; telemetry disabled"),
            }
        }
        Err(e) => println!("[✗] Invalid configuration: {}", e),
    }

    if utils::is_root() {
        println!("[✓] Running as root");
    } else {
        println!("[-] Not running as root; the network wrapper needs user namespaces");
    }

    println!("    UID: {}", utils::get_uid());
    println!("    GID: {}", utils::get_gid());
}
