use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hpdispatch::command::CommandObjective;
use hpdispatch::config::{parse_gpu_list, ParameterTree, Settings};
use hpdispatch::dispatch::{config_path, Budget, Dispatcher, Role, WorkerCommand};
use hpdispatch::sampler::SamplerKind;
use hpdispatch::storage::{reclaim, summaries, ReclaimPolicy, Storage, StorageHandle};
use hpdispatch::{StudyHandle, TrialState, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hpdispatch", version, about = "Hyperparameter search over batch queues and local workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule a study, or run as one of its workers.
    Run {
        /// Executable name; `<exe>.yaml` and `<exe>.tune.yaml` are read.
        exe: String,
        #[arg(long)]
        study: Option<String>,
        #[arg(long)]
        storage: Option<String>,
        #[arg(short = 't', long = "n-trials")]
        n_trials: Option<u64>,
        #[arg(short = 'm', long = "n-minutes")]
        n_minutes: Option<f64>,
        #[arg(long)]
        sampler: Option<String>,
        /// Override file merged over the executable and study files.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(short = 'j', long = "n-jobs")]
        n_jobs: Option<u64>,
        #[arg(long)]
        partition: Option<String>,
        #[arg(long)]
        tuner: Option<String>,
        /// Run as a worker even outside a batch allocation.
        #[arg(long)]
        worker: bool,
        /// Read the persisted tree instead of the layered files.
        #[arg(long)]
        from_config: Option<PathBuf>,
        #[arg(long)]
        remaining_trials: Option<u64>,
        #[arg(long)]
        remaining_minutes: Option<f64>,
        /// Parallel chains sharing the remaining budget.
        #[arg(long, default_value_t = 1)]
        chains: usize,
        /// Comma-separated GPU ids for this process.
        #[arg(long)]
        gpus: Option<String>,
        /// The objective command.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List studies.
    Ls {
        #[arg(long)]
        storage: Option<String>,
        /// Only studies of this executable.
        exe: Option<String>,
    },
    /// Delete studies by their `ls` index, e.g. `0,2-4`.
    Rm {
        indices: String,
        #[arg(long)]
        storage: Option<String>,
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Return abandoned running trials of a study to the queue.
    Reclaim {
        study: String,
        #[arg(long)]
        storage: Option<String>,
        #[arg(long, default_value_t = 60.0)]
        stale_minutes: f64,
        /// Reclaim every running trial regardless of age.
        #[arg(long)]
        all: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let env: HashMap<String, String> = std::env::vars().collect();
    match cli.command {
        Commands::Run {
            exe,
            study,
            storage,
            n_trials,
            n_minutes,
            sampler,
            config,
            n_jobs,
            partition,
            tuner,
            worker,
            from_config,
            remaining_trials,
            remaining_minutes,
            chains,
            gpus,
            command,
        } => {
            let mut tree = match &from_config {
                Some(path) => ParameterTree::load(path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                None => ParameterTree::layered(".", &exe, config.as_deref())?,
            };
            let overrides = [
                ("exe", Some(Value::from(exe.as_str()))),
                ("study", study.map(Value::from)),
                ("storage", storage.map(Value::from)),
                ("sampler", sampler.map(Value::from)),
                ("tuner", tuner.map(Value::from)),
                ("partition", partition.map(Value::from)),
                ("n_trials", n_trials.and_then(|n| i64::try_from(n).ok()).map(Value::from)),
                ("n_jobs", n_jobs.and_then(|n| i64::try_from(n).ok()).map(Value::from)),
                ("n_minutes", n_minutes.map(Value::from)),
                (
                    "command",
                    (!command.is_empty())
                        .then(|| Value::List(command.into_iter().map(Value::from).collect())),
                ),
            ];
            for (key, value) in overrides {
                if let Some(value) = value {
                    tree.set(key, value)?;
                }
            }
            let settings: Settings = tree.settings()?;
            let role = Role::detect(worker, &env);

            let storage = StorageHandle::new(settings.storage_url(&env).as_deref())?.get()?;
            let study = StudyHandle::create_or_load(
                storage,
                &settings.study_key(),
                SamplerKind::parse(settings.sampler.as_deref())?,
                &settings.directions,
                settings.load_if_exists || matches!(role, Role::Worker(_)),
            )?;

            let root = std::env::current_dir()?;
            let command = WorkerCommand {
                program: std::env::current_exe()?.display().to_string(),
                exe: settings.exe.clone(),
                config: from_config.unwrap_or_else(|| config_path(&root, &settings.study_key())),
            };
            let objective = CommandObjective::new(settings.command.clone(), &tree)?;
            let dispatcher = Dispatcher::new(settings, tree, study, command, root)?;
            let dispatcher = match gpus {
                Some(list) => dispatcher.with_gpus(parse_gpu_list(&list)),
                None => dispatcher,
            };
            let objective = objective.with_env(dispatcher.task_env());

            let remaining = (remaining_trials.is_some() || remaining_minutes.is_some()).then_some(
                Budget {
                    trials: remaining_trials,
                    minutes: remaining_minutes,
                },
            );
            dispatcher.launch(role, remaining, chains, &objective)?;
        }
        Commands::Ls { storage, exe } => {
            let storage = open_storage(storage, &env)?;
            let prefix = exe.map(|e| format!("{e}."));
            println!(
                "{:>4}  {:<32} {:<20} {:>8} {:>7} {:>7} {:>8} {:>8}",
                "#", "study", "started", "complete", "pruned", "failed", "running", "waiting"
            );
            for (i, summary) in summaries(storage.as_ref())?.iter().enumerate() {
                if prefix.as_ref().is_some_and(|p| !summary.study.name.starts_with(p.as_str())) {
                    continue;
                }
                println!(
                    "{:>4}  {:<32} {:<20} {:>8} {:>7} {:>7} {:>8} {:>8}",
                    i,
                    summary.study.name,
                    summary.study.datetime_start.format("%Y-%m-%d %H:%M").to_string(),
                    summary.count(TrialState::Complete),
                    summary.count(TrialState::Pruned),
                    summary.count(TrialState::Failed),
                    summary.count(TrialState::Running),
                    summary.count(TrialState::Waiting),
                );
            }
        }
        Commands::Rm {
            indices,
            storage,
            yes,
        } => {
            let storage = open_storage(storage, &env)?;
            let studies = storage.studies()?;
            let names = parse_indices(&indices)?
                .into_iter()
                .map(|i| {
                    studies
                        .get(i)
                        .map(|s| s.name.clone())
                        .with_context(|| format!("no study at index {i}"))
                })
                .collect::<Result<Vec<_>>>()?;
            for name in &names {
                println!("{name}");
            }
            if !yes && !confirm(&format!("Delete {} studies?", names.len()))? {
                return Ok(());
            }
            for name in &names {
                storage.delete_study(name)?;
            }
        }
        Commands::Reclaim {
            study,
            storage,
            stale_minutes,
            all,
        } => {
            let storage = open_storage(storage, &env)?;
            let policy = if all {
                ReclaimPolicy::Unconditional
            } else {
                ReclaimPolicy::Stale(Duration::from_secs_f64(stale_minutes.max(0.0) * 60.0))
            };
            let n = reclaim(storage.as_ref(), &study, policy)?;
            println!("{n} trials reclaimed");
        }
    }
    Ok(())
}

fn open_storage(
    url: Option<String>,
    env: &HashMap<String, String>,
) -> Result<std::sync::Arc<dyn Storage>> {
    let settings = Settings {
        storage: url,
        ..Settings::default()
    };
    let Some(url) = settings.storage_url(env) else {
        bail!("no ledger configured; pass --storage or set HPD_STORAGE");
    };
    Ok(StorageHandle::new(Some(&url))?.get()?)
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Parses `0,2-4` into `[0, 2, 3, 4]`.
fn parse_indices(spec: &str) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().with_context(|| format!("bad index '{part}'"))?;
                let hi: usize = hi.trim().parse().with_context(|| format!("bad index '{part}'"))?;
                if lo > hi {
                    bail!("bad range '{part}'");
                }
                out.extend(lo..=hi);
            }
            None => out.push(part.parse().with_context(|| format!("bad index '{part}'"))?),
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}
