use std::path::PathBuf;
use std::sync::Arc;

use hpdispatch::config::{ParameterTree, Settings};
use hpdispatch::context::RunContext;
use hpdispatch::dispatch::{config_path, Dispatcher, JobSpec, Submitter, WorkerCommand};
use hpdispatch::sampler::SamplerKind;
use hpdispatch::storage::MemoryStorage;
use hpdispatch::{Direction, StudyHandle};
use parking_lot::Mutex;

mod budget;
mod guard;

type Queue = Arc<Mutex<Vec<(JobSpec, usize)>>>;

/// Records submissions instead of sending them to a scheduler.
struct Recorder(Queue);

impl Submitter for Recorder {
    fn submit(&self, job: &JobSpec, replicas: usize, _wait: bool) -> hpdispatch::Result<()> {
        self.0.lock().push((job.clone(), replicas));
        Ok(())
    }
}

fn root() -> PathBuf {
    std::env::temp_dir().join(format!("hpd-it-{}", fastrand::u64(..)))
}

fn dispatcher(settings: Settings) -> (Dispatcher, Queue) {
    let root = root();
    let study = StudyHandle::create_or_load(
        Arc::new(MemoryStorage::new()),
        &settings.study_key(),
        SamplerKind::Random,
        &[Direction::Minimize],
        true,
    )
    .unwrap();
    let tree = ParameterTree::from_yaml_str(
        "x:\n  sample_type: float\n  sample_space: [-1.0, 1.0]\nscale: 2\nscaled: \"${scale * x}\"\n",
    )
    .unwrap();
    let command = WorkerCommand {
        program: "hpdispatch".into(),
        exe: settings.exe.clone(),
        config: config_path(&root, &settings.study_key()),
    };
    let queue = Queue::default();
    let dispatcher = Dispatcher::new(settings, tree, study, command, root)
        .unwrap()
        .with_submitter(Box::new(Recorder(Arc::clone(&queue))));
    (dispatcher, queue)
}

fn objective(ctx: &mut RunContext<'_>) -> hpdispatch::Result<f64> {
    ctx.get_f64("x")?;
    ctx.get_f64("scale")?;
    let scaled = ctx.get_f64("scaled")?;
    Ok(scaled * scaled)
}

/// The value of `--name=N` in a submitted command line.
fn flag(job: &JobSpec, name: &str) -> Option<u64> {
    let prefix = format!("--{name}=");
    job.argv
        .iter()
        .find_map(|a| a.strip_prefix(prefix.as_str()))
        .map(|v| v.parse().unwrap())
}
