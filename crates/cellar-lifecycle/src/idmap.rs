//! Id-shift tables for unprivileged containers.
//!
//! Files of an unprivileged container are owned on disk by host ids inside a
//! delegated range (`/etc/subuid`, `/etc/subgid`). Exported archives carry the
//! canonical ids the container itself sees, so ownership has to be unshifted
//! on the way out.

use cellar_common::CellarError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const DEFAULT_HOST_BASE: u32 = 100_000;
const DEFAULT_RANGE: u32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapEntry {
    pub is_uid: bool,
    pub is_gid: bool,
    pub ns_id: u32,
    pub host_id: u32,
    pub range: u32,
}

impl IdmapEntry {
    /// Host id -> namespace id, if `id` falls inside this entry.
    fn shift_from_ns(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.host_id)?;
        if offset < self.range {
            self.ns_id.checked_add(offset)
        } else {
            None
        }
    }

    /// Namespace id -> host id.
    fn shift_into_ns(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.ns_id)?;
        if offset < self.range {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

impl FromStr for IdmapEntry {
    type Err = CellarError;

    /// Parses `"<u|g|b> <nsid> <hostid> <range>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CellarError::BadRequest(format!("invalid idmap entry {s:?}"));
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [kind, ns_id, host_id, range] = fields.as_slice() else {
            return Err(bad());
        };
        let (is_uid, is_gid) = match *kind {
            "u" => (true, false),
            "g" => (false, true),
            "b" => (true, true),
            _ => return Err(bad()),
        };
        let entry = IdmapEntry {
            is_uid,
            is_gid,
            ns_id: ns_id.parse().map_err(|_| bad())?,
            host_id: host_id.parse().map_err(|_| bad())?,
            range: range.parse().map_err(|_| bad())?,
        };
        if entry.range == 0 {
            return Err(bad());
        }
        Ok(entry)
    }
}

impl fmt::Display for IdmapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (self.is_uid, self.is_gid) {
            (true, true) => "b",
            (true, false) => "u",
            _ => "g",
        };
        write!(f, "{} {} {} {}", kind, self.ns_id, self.host_id, self.range)
    }
}

/// A container's full uid/gid shift table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapSet {
    pub entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn new(entries: Vec<IdmapEntry>) -> Self {
        Self { entries }
    }

    pub fn parse_lines<I, S>(lines: I) -> Result<Self, CellarError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = lines
            .into_iter()
            .map(|l| l.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Unshifts on-disk ownership. Each id is `None` when no entry covers it.
    pub fn shift_from_ns(&self, uid: u32, gid: u32) -> (Option<u32>, Option<u32>) {
        let uid = self
            .entries
            .iter()
            .filter(|e| e.is_uid)
            .find_map(|e| e.shift_from_ns(uid));
        let gid = self
            .entries
            .iter()
            .filter(|e| e.is_gid)
            .find_map(|e| e.shift_from_ns(gid));
        (uid, gid)
    }

    pub fn shift_into_ns(&self, uid: u32, gid: u32) -> (Option<u32>, Option<u32>) {
        let uid = self
            .entries
            .iter()
            .filter(|e| e.is_uid)
            .find_map(|e| e.shift_into_ns(uid));
        let gid = self
            .entries
            .iter()
            .filter(|e| e.is_gid)
            .find_map(|e| e.shift_into_ns(gid));
        (uid, gid)
    }

    /// Builds the map delegated to `user` by `/etc/subuid` and `/etc/subgid`,
    /// falling back to `b 0 100000 65536`.
    pub fn default_for_user(user: &str) -> Self {
        Self::from_subid_files(user, Path::new("/etc/subuid"), Path::new("/etc/subgid"))
    }

    pub fn from_subid_files(user: &str, subuid: &Path, subgid: &Path) -> Self {
        let uid = read_subid(subuid, user);
        let gid = read_subid(subgid, user);
        let (uid_base, uid_range) = uid.unwrap_or((DEFAULT_HOST_BASE, DEFAULT_RANGE));
        let (gid_base, gid_range) = gid.unwrap_or((DEFAULT_HOST_BASE, DEFAULT_RANGE));

        if (uid_base, uid_range) == (gid_base, gid_range) {
            return Self::new(vec![IdmapEntry {
                is_uid: true,
                is_gid: true,
                ns_id: 0,
                host_id: uid_base,
                range: uid_range,
            }]);
        }
        Self::new(vec![
            IdmapEntry {
                is_uid: true,
                is_gid: false,
                ns_id: 0,
                host_id: uid_base,
                range: uid_range,
            },
            IdmapEntry {
                is_uid: false,
                is_gid: true,
                ns_id: 0,
                host_id: gid_base,
                range: gid_range,
            },
        ])
    }
}

fn read_subid(path: &Path, user: &str) -> Option<(u32, u32)> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No subordinate id file");
            return None;
        }
    };
    content.lines().find_map(|line| {
        let mut parts = line.trim().split(':');
        if parts.next()? != user {
            return None;
        }
        let base = parts.next()?.parse().ok()?;
        let range = parts.next()?.parse().ok()?;
        Some((base, range))
    })
}
