use std::path::PathBuf;

use anyhow::Result;
use log::info;
use loftr::{Key, Manifest, Repository};

#[derive(Debug, Clone)]
pub struct Options {
    pub repository: PathBuf,
    pub plaintext: bool,
}

pub async fn run(opts: Options) -> Result<()> {
    let mut repository = Repository::create(&opts.repository).await?;
    let key = if opts.plaintext {
        Key::Plaintext
    } else {
        Key::generate()
    };
    key.save(&repository.keyfile_path())?;
    let mut manifest = Manifest::new();
    manifest.write(&mut repository, &key)?;
    repository.commit().await?;
    info!("Initialized repository at {}", opts.repository.display());
    if !opts.plaintext {
        info!(
            "Key material written to {}, keep a copy of it somewhere safe",
            repository.keyfile_path().display()
        );
    }
    Ok(())
}
