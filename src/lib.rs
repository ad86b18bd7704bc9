#[macro_use]
extern crate log;

mod builder;
mod cache;
mod error;
mod expr;
mod fs_access;
mod job;
mod mutation;
mod output;
mod path_mapper;
mod runtime;
mod tool;
mod value;

pub use builder::{Binding, Builder, FsFactory};
pub use cache::{CacheLock, cache_key, canonical_json};
pub use error::{Error, Result};
pub use expr::{EvalContext, Evaluator, ParamRefEvaluator};
pub use fs_access::{FsAccess, StdFsAccess};
pub use job::{
    CallbackJob, CommandJob, ContainerBackend, ExpressionJob, OutputCallback, Prepared,
    ProcessStatus,
};
pub use mutation::MutationManager;
pub use output::{OutputCollector, compute_checksums, revmap_file, substitute};
pub use path_mapper::{MapType, MapperEntry, PathMapper};
pub use runtime::{FindDefaultContainer, RuntimeContext};
pub use tool::{AbstractOperation, CommandLineTool, ExpressionTool, Tool};
pub use value::{LoadListing, normalize_files_dirs, shortname, uniquename};
