use std::path::PathBuf;

use anyhow::Result;
use loftr::Archive;

use crate::session::{self, Session};

#[derive(Debug, Clone)]
pub struct Options {
    pub repository: PathBuf,
    pub archive: Option<String>,
}

pub async fn run(opts: Options) -> Result<()> {
    let session = session::open(&opts.repository).await?;
    let Session {
        mut repository,
        key,
        manifest,
    } = session;

    match &opts.archive {
        None => {
            for (name, info) in &manifest.archives {
                println!("{:<36} {}", name, info.time);
            }
        }
        Some(name) => {
            let archive = Archive::open(&mut repository, &key, &manifest, name).await?;
            let mut items = archive.iter_items(None, false);
            while let Some(item) = items.next(&mut repository, &key).await? {
                let owner = match (&item.user, &item.group) {
                    (Some(user), Some(group)) => format!("{}:{}", user, group),
                    _ => format!("{}:{}", item.uid, item.gid),
                };
                println!("{:06o} {:>16} {}", item.mode, owner, item.path);
            }
        }
    }
    Ok(())
}
