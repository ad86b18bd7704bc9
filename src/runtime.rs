use crate::{
    Result,
    builder::FsFactory,
    expr::{Evaluator, ParamRefEvaluator},
    fs_access::{FsAccess, StdFsAccess},
    mutation::MutationManager,
    value::LoadListing,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

pub type FindDefaultContainer = dyn Fn(&Value) -> Option<String> + Send + Sync;

/// Everything the preparer needs from the outside world, passed explicitly
/// rather than read from ambient globals. Cloning is cheap; the preparer
/// clones and redirects `outdir` when a cache entry is being populated.
#[derive(Clone)]
pub struct RuntimeContext {
    pub basedir: String,
    /// Host output directory. Created under `tmp_outdir_prefix` when unset.
    pub outdir: Option<String>,
    pub tmpdir: Option<String>,
    pub stagedir: Option<String>,
    pub tmp_outdir_prefix: String,
    /// Enables the content-addressed job cache when set.
    pub cachedir: Option<String>,
    pub use_container: bool,
    pub singularity: bool,
    pub user_space_docker_cmd: Option<String>,
    /// In-container sandbox paths; random `/`-rooted segments when unset.
    pub docker_outdir: Option<String>,
    pub docker_tmpdir: Option<String>,
    pub docker_stagedir: Option<String>,
    pub default_container: Option<String>,
    pub find_default_container: Option<Arc<FindDefaultContainer>>,
    pub compute_checksum: bool,
    /// Reject staged basenames outside `[A-Za-z0-9._+-]` when true.
    pub strict_filenames: bool,
    pub load_listing: LoadListing,
    pub name: Option<String>,
    pub mutation_manager: Option<Arc<MutationManager>>,
    pub evaluator: Arc<dyn Evaluator>,
    pub fs_factory: Arc<FsFactory>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            basedir: ".".into(),
            outdir: None,
            tmpdir: None,
            stagedir: None,
            tmp_outdir_prefix: std::env::temp_dir()
                .join("cwlrun")
                .to_string_lossy()
                .into_owned(),
            cachedir: None,
            use_container: false,
            singularity: false,
            user_space_docker_cmd: None,
            docker_outdir: None,
            docker_tmpdir: None,
            docker_stagedir: None,
            default_container: None,
            find_default_container: None,
            compute_checksum: true,
            strict_filenames: true,
            load_listing: LoadListing::default(),
            name: None,
            mutation_manager: None,
            evaluator: Arc::new(ParamRefEvaluator),
            fs_factory: Arc::new(|basedir: &str| {
                Arc::new(StdFsAccess::new(basedir)) as Arc<dyn FsAccess>
            }),
        }
    }
}

impl RuntimeContext {
    pub fn fs_access(&self, basedir: &str) -> Arc<dyn FsAccess> {
        (self.fs_factory)(basedir)
    }

    /// Create a fresh scratch directory under the temp-output prefix.
    pub fn create_tmpdir(&self) -> Result<String> {
        let prefix = Path::new(&self.tmp_outdir_prefix);
        let dir = prefix.parent().unwrap_or(Path::new("/tmp"));
        let name = prefix
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cwlrun".into());
        std::fs::create_dir_all(dir)?;
        let td = tempfile::Builder::new().prefix(&name).tempdir_in(dir)?;
        Ok(td.keep().to_string_lossy().into_owned())
    }
}
