// The worker signals process trees and relies on POSIX process groups.
#[cfg(not(unix))]
fn main() {
    eprintln!("hpcflow-job-runner is only supported on Unix systems (Linux/macOS).");
    std::process::exit(1);
}

#[cfg(unix)]
mod unix_main {
    use chrono::Utc;
    use clap::{Parser, builder::styling};
    use hpcflow::client::hpc::create_adapters;
    use hpcflow::client::job_runner::{
        JobRunner, WorkerRules, default_worker_id, detect_worker_resources,
    };
    use hpcflow::client::log_paths::get_worker_log_file;
    use hpcflow::client::store::{GraphStore, RemoteStore};
    use hpcflow::client::utils::{RetryPolicy, send_with_retries};
    use hpcflow::config::{ConfigPaths, EngineConfig};
    use hpcflow::logging::{LoggingOptions, init_logging};
    use log::{error, info};
    use signal_hook::consts::SIGTERM;
    use signal_hook::iterator::Signals;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;

    const STYLES: styling::Styles = styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default().bold())
        .usage(styling::AnsiColor::Green.on_default().bold())
        .literal(styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(styling::AnsiColor::Cyan.on_default());

    #[derive(Parser, Debug)]
    #[command(name = "hpcflow-job-runner")]
    #[command(about = "Claim and run hpcflow jobs on this node", long_about = None)]
    #[command(styles = STYLES)]
    struct Args {
        /// Graph store URL
        #[arg()]
        url: String,

        /// Workflow key
        #[arg()]
        workflow_key: String,

        /// Output directory for job logs and user data
        #[arg()]
        output_dir: PathBuf,

        /// Poll interval for ready jobs and cancellation (seconds)
        #[arg(short, long)]
        poll_interval: Option<f64>,

        /// Wall-time budget of this worker, e.g. "PT4H" or "04:00:00"
        #[arg(long)]
        time_limit: Option<String>,

        /// Seconds a job is given after SIGTERM before it is killed
        #[arg(long)]
        grace_period: Option<f64>,

        #[arg(long)]
        num_cpus: Option<i64>,

        #[arg(long)]
        memory_gb: Option<f64>,

        #[arg(long)]
        num_gpus: Option<i64>,

        /// Exit after this many seconds without claiming a job (0 waits for completion)
        #[arg(long)]
        wait_for_new_jobs_seconds: Option<u64>,

        /// Worker id. Defaults to <hostname>-<pid>-<random>.
        #[arg(long)]
        worker_id: Option<String>,

        /// Additional configuration file, applied after the standard locations
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long)]
        log_level: Option<String>,
    }

    fn load_config(args: &Args) -> hpcflow::Result<EngineConfig> {
        let mut files = ConfigPaths::new().existing_paths();
        if let Some(ref extra) = args.config {
            files.push(extra.clone());
        }
        let mut config = EngineConfig::load_from_files(&files)?;

        config.client.api_url = args.url.clone();
        let run = &mut config.client.run;
        run.output_dir = args.output_dir.clone();
        if let Some(poll_interval) = args.poll_interval {
            run.poll_interval = poll_interval;
        }
        if let Some(ref time_limit) = args.time_limit {
            run.time_limit = Some(time_limit.clone());
        }
        if let Some(grace) = args.grace_period {
            run.grace_period_seconds = grace;
        }
        if args.num_cpus.is_some() {
            run.num_cpus = args.num_cpus;
        }
        if args.memory_gb.is_some() {
            run.memory_gb = args.memory_gb;
        }
        if args.num_gpus.is_some() {
            run.num_gpus = args.num_gpus;
        }
        if let Some(wait) = args.wait_for_new_jobs_seconds {
            run.wait_for_new_jobs_seconds = wait;
        }
        if let Some(ref level) = args.log_level {
            config.client.log_level = level.clone();
        }

        config
            .validate()
            .map_err(|errors| hpcflow::EngineError::Config(errors.join("; ")))?;
        Ok(config)
    }

    pub fn main() {
        let args = Args::parse();
        let start_time = Utc::now();

        let config = match load_config(&args) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                std::process::exit(1);
            }
        };
        let run = &config.client.run;
        let worker_id = args.worker_id.clone().unwrap_or_else(default_worker_id);

        let log_file_path = get_worker_log_file(&run.output_dir, &worker_id);
        let logging = match init_logging(&LoggingOptions {
            level: config.client.log_level.clone(),
            log_file: Some(log_file_path.clone()),
            prefix: Some(worker_id.clone()),
        }) {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("Error creating log file {}: {}", log_file_path.display(), e);
                std::process::exit(1);
            }
        };

        info!("Worker ID: {}", worker_id);
        info!("Output directory: {}", run.output_dir.display());
        info!("Log file: {}", log_file_path.display());

        let store: Arc<dyn GraphStore> = match RemoteStore::new(&config.client.api_url) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Error creating graph store client: {}", e);
                logging.flush();
                std::process::exit(1);
            }
        };

        let retry = RetryPolicy::from_minutes(run.wait_for_healthy_store_minutes);
        let workflow = match send_with_retries(|| store.get_workflow(&args.workflow_key), &retry)
        {
            Ok(wf) => wf,
            Err(e) => {
                error!("Error getting workflow: {}", e);
                logging.flush();
                std::process::exit(1);
            }
        };

        let adapters = match create_adapters(&config.hpc) {
            Ok(adapters) => adapters,
            Err(e) => {
                error!("Error creating scheduler adapters: {}", e);
                logging.flush();
                std::process::exit(1);
            }
        };

        let end_time = run
            .time_limit_seconds()
            .map(|secs| start_time + chrono::Duration::seconds(secs as i64));
        if let Some(end) = end_time {
            info!("End time: {}", end);
        }

        let mut job_runner = JobRunner::new(
            store,
            workflow,
            &worker_id,
            run.output_dir.clone(),
            detect_worker_resources(run),
            WorkerRules::from_config(run, &config.hpc),
        )
        .with_adapters(adapters)
        .with_end_time(end_time)
        .with_retry_policy(retry);

        // A batch scheduler sends SIGTERM shortly before the allocation's walltime.
        let termination_flag = job_runner.get_termination_flag();
        let mut signals = match Signals::new([SIGTERM]) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                logging.flush();
                std::process::exit(1);
            }
        };
        thread::spawn(move || {
            for sig in signals.forever() {
                if sig == SIGTERM {
                    info!("Received SIGTERM signal. Initiating graceful shutdown.");
                    termination_flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });

        let exit_code = match job_runner.run_worker() {
            Ok(result) => {
                info!(
                    "Worker finished exit_reason={} jobs_run={} had_failures={} had_terminations={} had_cancellations={}",
                    result.exit_reason,
                    result.jobs_run,
                    result.had_failures,
                    result.had_terminations,
                    result.had_cancellations
                );
                if result.had_failures { 1 } else { 0 }
            }
            Err(e) => {
                error!("JobRunner::run_worker failed: {}", e);
                1
            }
        };
        logging.flush();
        std::process::exit(exit_code);
    }
}

#[cfg(unix)]
fn main() {
    unix_main::main();
}
