//! Spool directory layout, relative to the configured spool root
//! (spec.md §6). One function per well-known file/directory.

use std::path::{Path, PathBuf};

use crate::config::ITEMID_LEN;

#[derive(Clone, Debug)]
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Spool { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sequence(&self) -> PathBuf {
        self.root.join("sequence")
    }

    pub fn idarbiter(&self) -> PathBuf {
        self.root.join("idarbiter")
    }

    pub fn index(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn item_dir(&self) -> PathBuf {
        self.root.join("item")
    }

    pub fn item(&self, id: &str) -> PathBuf {
        debug_assert_eq!(id.len(), ITEMID_LEN);
        self.item_dir().join(id)
    }

    pub fn item_edited(&self, id: &str) -> PathBuf {
        let mut p = self.item(id).into_os_string();
        p.push(".edited");
        PathBuf::from(p)
    }

    pub fn index_edited(&self) -> PathBuf {
        let mut p = self.index().into_os_string();
        p.push(".edited");
        PathBuf::from(p)
    }

    pub fn editlock(&self) -> PathBuf {
        self.root.join("editlock")
    }

    pub fn editlog(&self) -> PathBuf {
        self.root.join("editlog")
    }

    pub fn motd(&self) -> PathBuf {
        self.root.join("motd")
    }

    pub fn secretseed(&self) -> PathBuf {
        self.root.join("secretseed")
    }

    pub fn userdatabase(&self) -> PathBuf {
        self.root.join("userdatabase")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("log")
    }

    /// Creates every directory/seed file a fresh spool needs, so the
    /// server can start against an empty install (scenario 1 in spec.md
    /// §8: "Fresh install, no users").
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.item_dir())?;
        std::fs::create_dir_all(self.log_dir())?;
        for (path, seed) in [
            (self.sequence(), b"00000000\n".as_slice()),
            (self.idarbiter(), b"00000000\n".as_slice()),
            (self.index(), b"".as_slice()),
            (self.secretseed(), b"".as_slice()),
        ] {
            if !path.exists() {
                std::fs::write(path, seed)?;
            }
        }
        if !self.userdatabase().exists() {
            let empty_record = vec![0u8; crate::userdb::RECORD_LEN];
            let mut buf = Vec::with_capacity(empty_record.len() * crate::config::USERDB_INITIAL_CAPACITY);
            for _ in 0..crate::config::USERDB_INITIAL_CAPACITY {
                buf.extend_from_slice(&empty_record);
            }
            std::fs::write(self.userdatabase(), buf)?;
        }
        if !self.editlock().exists() {
            std::fs::write(self.editlock(), vec![b' '; crate::config::USERID_MAXLEN])?;
        }
        Ok(())
    }
}
