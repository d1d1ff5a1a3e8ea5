//! Configuration tree and launch settings.

mod settings;
mod tree;

pub use settings::{parse_gpu_list, Settings, RESERVED_KEYS};
pub use tree::{normalize_path, segments, ParameterNode, ParameterTree, SampleKind, SampleSpec};
