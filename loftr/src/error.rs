use crate::ChunkId;

pub enum Error {
    NotARepository,
    ArchiveExists(String),
    ArchiveDoesNotExist(String),
    UnknownArchiveVersion(u32),
    UnknownManifestVersion(u32),
    UnknownKeyType(u8),
    UnsafePath(String),
    UnknownItemType(u32),
    Crypto,
    ChunkMissing(ChunkId),
    MetadataDecode(rmp_serde::decode::Error),
    MetadataEncode(rmp_serde::encode::Error),
    InvalidTimestamp(chrono::format::ParseError),
    IO(std::io::Error),
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::IO(e)
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::MetadataDecode(e)
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::MetadataEncode(e)
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::IO(e.into())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::IO(std::io::Error::from_raw_os_error(e as i32))
    }
}

impl From<chacha20poly1305::aead::Error> for Error {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        Self::Crypto
    }
}

impl From<chrono::format::ParseError> for Error {
    fn from(e: chrono::format::ParseError) -> Self {
        Self::InvalidTimestamp(e)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotARepository => write!(f, "NotARepository"),
            Error::ArchiveExists(name) => write!(f, "ArchiveExists({})", name),
            Error::ArchiveDoesNotExist(name) => write!(f, "ArchiveDoesNotExist({})", name),
            Error::UnknownArchiveVersion(v) => write!(f, "UnknownArchiveVersion({})", v),
            Error::UnknownManifestVersion(v) => write!(f, "UnknownManifestVersion({})", v),
            Error::UnknownKeyType(t) => write!(f, "UnknownKeyType({:#04x})", t),
            Error::UnsafePath(path) => write!(f, "UnsafePath({})", path),
            Error::UnknownItemType(mode) => write!(f, "UnknownItemType({:#o})", mode),
            Error::Crypto => write!(f, "Crypto"),
            Error::ChunkMissing(id) => write!(f, "ChunkMissing({})", id),
            Error::MetadataDecode(e) => write!(f, "MetadataDecode({:?})", e),
            Error::MetadataEncode(e) => write!(f, "MetadataEncode({:?})", e),
            Error::InvalidTimestamp(e) => write!(f, "InvalidTimestamp({:?})", e),
            Error::IO(e) => write!(f, "IO({:?})", e),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotARepository => write!(f, "not a repository"),
            Error::ArchiveExists(name) => write!(f, "archive {} already exists", name),
            Error::ArchiveDoesNotExist(name) => write!(f, "archive {} does not exist", name),
            Error::UnknownArchiveVersion(v) => write!(f, "unknown archive metadata version {}", v),
            Error::UnknownManifestVersion(v) => write!(f, "unknown manifest version {}", v),
            Error::UnknownKeyType(t) => write!(f, "unknown key type {:#04x}", t),
            Error::UnsafePath(path) => {
                write!(f, "path {} should be relative and local", path)
            }
            Error::UnknownItemType(mode) => write!(f, "unknown item file type {:#o}", mode),
            Error::Crypto => write!(f, "decryption or authentication failed"),
            Error::ChunkMissing(id) => write!(f, "chunk {} missing from repository", id),
            Error::MetadataDecode(e) => write!(f, "failed to decode metadata: {}", e),
            Error::MetadataEncode(e) => write!(f, "failed to encode metadata: {}", e),
            Error::InvalidTimestamp(e) => write!(f, "invalid archive timestamp: {}", e),
            Error::IO(e) => write!(f, "i/o error: {}", e),
        }
    }
}
