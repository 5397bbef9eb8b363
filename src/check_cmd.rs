use std::path::PathBuf;

use anyhow::{bail, Result};
use loftr::{ArchiveChecker, Repository};

#[derive(Debug, Clone)]
pub struct Options {
    pub repository: PathBuf,
    pub repair: bool,
}

pub async fn run(opts: Options) -> Result<()> {
    let mut repository = Repository::open(&opts.repository).await?;
    let checker = ArchiveChecker::new(opts.repair)?;
    if !checker.check(&mut repository).await? {
        bail!("repository check reported errors, re-run with --repair to fix them");
    }
    Ok(())
}
