use std::path::PathBuf;

use anyhow::Result;
use loftr::{Archive, Extractor, ExtractorOptions, Item, ItemFilter};

use crate::session::{self, Session};

#[derive(Debug, Clone)]
pub struct Options {
    pub repository: PathBuf,
    pub archive: String,
    pub patterns: Vec<String>,
    pub dest: PathBuf,
    pub dry_run: bool,
    pub numeric_owner: bool,
}

pub async fn run(opts: Options) -> Result<()> {
    let session = session::open(&opts.repository).await?;
    let Session {
        mut repository,
        key,
        manifest,
    } = session;

    let archive = Archive::open(&mut repository, &key, &manifest, &opts.archive).await?;
    let filter: Option<ItemFilter> = if opts.patterns.is_empty() {
        None
    } else {
        let patterns = opts.patterns.clone();
        Some(Box::new(move |item: &Item| {
            patterns.iter().any(|pattern| {
                item.path == *pattern || item.path.starts_with(&format!("{}/", pattern))
            })
        }))
    };
    let mut items = archive.iter_items(filter, true);
    let mut extractor = Extractor::new(
        &opts.dest,
        ExtractorOptions {
            restore_attrs: true,
            dry_run: opts.dry_run,
            numeric_owner: opts.numeric_owner,
        },
    );
    while let Some(item) = items.next(&mut repository, &key).await? {
        extractor.extract_item(&mut repository, &key, &item).await?;
    }
    Ok(())
}
