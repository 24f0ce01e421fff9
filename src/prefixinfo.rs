//! Per-directory records
//!
//! A [`PrefixInfo`] is the stored unit of incremental state: one
//! directory's owner, attributes, and the [`FileInfo`] of each direct
//! child in listing order. When the children are not all owned by the
//! directory's own (uid, gid), an [`IdMaps`] list assigns each child index
//! to its ownership pair.
//!
//! The binary layout is a stable on-disk format. All integers are
//! little-endian; counts are LEB128 varints.

use crate::error::{Error, Result};
use crate::idmap::{
    append_uvarint, read_uvarint, take_i32, take_i64, take_u32, take_u64, IDMap, IdMaps,
};
use chrono::{DateTime, TimeZone, Utc};

/// Record magic: "PUDI" when read as little-endian bytes.
const MAGIC: u32 = 0x4944_5550;

/// Current encoding version.
const VERSION: u8 = 1;

/// A single directory entry as observed by the OS.
///
/// `name` is the entry name, never a path. Modification time is split into
/// whole seconds and a nanosecond remainder so no precision is lost across
/// the codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: i64,
    /// File type and permission bits, st_mode layout.
    pub mode: u32,
    pub mod_sec: i64,
    pub mod_nsec: i32,
    /// Inode-like identity, used for hardlink detection.
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
}

impl FileInfo {
    /// Whether the mode bits mark this entry as a directory.
    pub fn is_dir(&self) -> bool {
        self.type_bits() == libc::S_IFDIR as u32
    }

    /// The file-type bits alone, for change comparison.
    pub fn type_bits(&self) -> u32 {
        self.mode & libc::S_IFMT as u32
    }

    /// Modification time as a UTC timestamp.
    pub fn modified(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.mod_sec, self.mod_nsec as u32)
            .single()
            .unwrap_or_default()
    }
}

/// The stored record for one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixInfo {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mod_sec: i64,
    pub mod_nsec: i32,
    /// Size of the directory inode itself.
    pub size: i64,
    /// Direct children in the order the listing primitive returned them.
    /// The order is load-bearing: IDMap bit positions index into it.
    pub files: Vec<FileInfo>,
    idms: Option<IdMaps>,
}

impl PrefixInfo {
    pub fn new(
        uid: u32,
        gid: u32,
        mode: u32,
        mod_sec: i64,
        mod_nsec: i32,
        size: i64,
        files: Vec<FileInfo>,
    ) -> Self {
        Self {
            uid,
            gid,
            mode,
            mod_sec,
            mod_nsec,
            size,
            files,
            idms: None,
        }
    }

    /// Build a record for a directory from its own stat info and its
    /// children in listing order.
    pub fn from_dir_info(info: &FileInfo, files: Vec<FileInfo>) -> Self {
        Self::new(
            info.uid,
            info.gid,
            info.mode,
            info.mod_sec,
            info.mod_nsec,
            info.size,
            files,
        )
    }

    /// Rebuild the ownership maps from `files`.
    ///
    /// When every child matches the directory's own (uid, gid) the maps are
    /// dropped entirely. Otherwise one map is allocated per distinct pair,
    /// in order of first appearance, and each child index is set in its
    /// pair's map. Idempotent.
    pub fn create_id_maps(&mut self) {
        let n = self.files.len();
        if self
            .files
            .iter()
            .all(|f| f.uid == self.uid && f.gid == self.gid)
        {
            self.idms = None;
            return;
        }
        let mut idms = IdMaps::default();
        for (i, f) in self.files.iter().enumerate() {
            let at = match idms.idmap_for(f.uid, f.gid) {
                Some(at) => at,
                None => {
                    idms.0.push(IDMap::new(f.uid, f.gid, n));
                    idms.0.len() - 1
                }
            };
            idms.0[at].set(i);
        }
        self.idms = Some(idms);
    }

    /// The ownership maps, if the directory is heterogeneous.
    pub fn id_maps(&self) -> Option<&IdMaps> {
        self.idms.as_ref()
    }

    /// The (uid, gid) owning the child at `index`.
    ///
    /// Falls back to the directory's own pair when no map covers the index.
    pub fn user_group(&self, index: usize) -> (u32, u32) {
        match &self.idms {
            None => (self.uid, self.gid),
            Some(idms) => idms
                .map_for_position(index)
                .map(|m| (m.uid, m.gid))
                .unwrap_or((self.uid, self.gid)),
        }
    }

    /// Assign ownership of the child at `index`, rebuilding the maps when
    /// the pair differs from what is already recorded.
    pub fn set_user_group(&mut self, index: usize, uid: u32, gid: u32) {
        if self.user_group(index) == (uid, gid) {
            return;
        }
        self.files[index].uid = uid;
        self.files[index].gid = gid;
        self.create_id_maps();
    }

    /// Modification time of the directory inode as a UTC timestamp.
    pub fn modified(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.mod_sec, self.mod_nsec as u32)
            .single()
            .unwrap_or_default()
    }

    /// Encode to the stable binary form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.files.len() * 48);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(VERSION);
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.mod_sec.to_le_bytes());
        buf.extend_from_slice(&self.mod_nsec.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        append_uvarint(&mut buf, self.files.len() as u64);
        for f in &self.files {
            append_uvarint(&mut buf, f.name.len() as u64);
            buf.extend_from_slice(f.name.as_bytes());
            buf.extend_from_slice(&f.size.to_le_bytes());
            buf.extend_from_slice(&f.mode.to_le_bytes());
            buf.extend_from_slice(&f.mod_sec.to_le_bytes());
            buf.extend_from_slice(&f.mod_nsec.to_le_bytes());
            buf.extend_from_slice(&f.inode.to_le_bytes());
            buf.extend_from_slice(&f.uid.to_le_bytes());
            buf.extend_from_slice(&f.gid.to_le_bytes());
        }
        match &self.idms {
            None => append_uvarint(&mut buf, 0),
            Some(idms) => idms.append_binary(&mut buf),
        }
        buf
    }

    /// Decode from the stable binary form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (magic, buf) = take_u32(buf)?;
        if magic != MAGIC {
            return Err(Error::CorruptRecord(format!(
                "bad magic {magic:#x}, want {MAGIC:#x}"
            )));
        }
        let Some((&version, buf)) = buf.split_first() else {
            return Err(Error::CorruptRecord("truncated version".into()));
        };
        if version != VERSION {
            return Err(Error::CorruptRecord(format!(
                "unknown version {version}, want {VERSION}"
            )));
        }
        let (uid, buf) = take_u32(buf)?;
        let (gid, buf) = take_u32(buf)?;
        let (mode, buf) = take_u32(buf)?;
        let (mod_sec, buf) = take_i64(buf)?;
        let (mod_nsec, buf) = take_i32(buf)?;
        let (size, buf) = take_i64(buf)?;
        let (n_files, mut rest) = read_uvarint(buf)?;
        let mut files = Vec::with_capacity(n_files as usize);
        for _ in 0..n_files {
            let (name_len, r) = read_uvarint(rest)?;
            let name_len = name_len as usize;
            if r.len() < name_len {
                return Err(Error::CorruptRecord("truncated file name".into()));
            }
            let name = std::str::from_utf8(&r[..name_len])
                .map_err(|_| Error::CorruptRecord("file name is not utf-8".into()))?
                .to_string();
            let r = &r[name_len..];
            let (size, r) = take_i64(r)?;
            let (mode, r) = take_u32(r)?;
            let (mod_sec, r) = take_i64(r)?;
            let (mod_nsec, r) = take_i32(r)?;
            let (inode, r) = take_u64(r)?;
            let (uid, r) = take_u32(r)?;
            let (gid, r) = take_u32(r)?;
            files.push(FileInfo {
                name,
                size,
                mode,
                mod_sec,
                mod_nsec,
                inode,
                uid,
                gid,
            });
            rest = r;
        }
        let (idms, rest) = IdMaps::decode_binary(rest)?;
        if !rest.is_empty() {
            return Err(Error::CorruptRecord(format!(
                "{} trailing bytes",
                rest.len()
            )));
        }
        Ok(Self {
            uid,
            gid,
            mode,
            mod_sec,
            mod_nsec,
            size,
            files,
            idms: if idms.is_empty() { None } else { Some(idms) },
        })
    }
}
