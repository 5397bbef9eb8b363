use std::fmt;

/// Size accounting accumulated while chunks are added or referenced.
///
/// `osize`/`csize` count every logical reference, `ucsize` only the first
/// reference of each chunk, which makes it the actual repository growth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub osize: u64,
    pub csize: u64,
    pub ucsize: u64,
    pub nfiles: u64,
}

impl Statistics {
    pub fn update(&mut self, size: u32, csize: u32, unique: bool) {
        self.osize += u64::from(size);
        self.csize += u64::from(csize);
        if unique {
            self.ucsize += u64::from(csize);
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} B original, {} B stored, {} B deduplicated",
            self.nfiles, self.osize, self.csize, self.ucsize
        )
    }
}
