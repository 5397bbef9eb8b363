use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use log::info;
use loftr::{ArchiveWriter, WriterOptions};

use crate::session::{self, Session};

#[derive(Debug, Clone)]
pub struct Options {
    pub repository: PathBuf,
    pub archive: String,
    pub paths: Vec<PathBuf>,
    pub checkpoint_interval: Duration,
    pub numeric_owner: bool,
}

pub async fn run(opts: Options) -> Result<()> {
    let mut session = session::open(&opts.repository).await?;
    let mut cache = session.open_cache().await?;
    let Session {
        mut repository,
        key,
        mut manifest,
    } = session;

    let mut writer = ArchiveWriter::new(
        &key,
        &manifest,
        &opts.archive,
        WriterOptions {
            checkpoint_interval: opts.checkpoint_interval,
            numeric_owner: opts.numeric_owner,
        },
    )?;
    for path in &opts.paths {
        writer
            .archive_tree(&mut repository, &key, &mut cache, &mut manifest, path)
            .await?;
    }
    let archive = writer
        .save(&mut repository, &key, &mut cache, &mut manifest)
        .await?;
    info!("Created archive {} ({})", archive.name(), archive.id);
    info!("{}", writer.stats());
    Ok(())
}
