use std::path::PathBuf;

use anyhow::Result;
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
        manifest,
    } = session;

    let archive = Archive::open(&mut repository, &key, &manifest, &opts.archive).await?;
    let stats = archive.calc_stats(&mut repository, &key, &mut cache).await?;
    println!("Name: {}", archive.name());
    println!("Id: {}", archive.id);
    println!("Time: {}", archive.ts()?);
    println!("Hostname: {}", archive.meta.hostname);
    println!("Username: {}", archive.meta.username);
    println!("Command line: {}", archive.meta.cmdline.join(" "));
    println!("Number of files: {}", stats.nfiles);
    println!("Original size: {} B", stats.osize);
    println!("Stored size: {} B", stats.csize);
    println!("Unique to this archive: {} B", stats.ucsize);
    Ok(())
}
