use std::path::PathBuf;

use anyhow::Result;
use log::info;
use loftr::Archive;

use crate::session::{self, Session};

#[derive(Debug, Clone)]
pub struct Options {
    pub repository: PathBuf,
    pub archive: String,
}

pub async fn run(opts: Options) -> Result<()> {
    let mut session = session::open(&opts.repository).await?;
    let mut cache = session.open_cache().await?;
    let Session {
        mut repository,
        key,
        mut manifest,
    } = session;

    let archive = Archive::open(&mut repository, &key, &manifest, &opts.archive).await?;
    archive
        .delete(&mut repository, &key, &mut manifest, &mut cache)
        .await?;
    info!("Deleted archive {}", opts.archive);
    Ok(())
}
