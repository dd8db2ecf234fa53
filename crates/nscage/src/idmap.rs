//! Uid/gid map construction for a child user namespace.
//!
//! Writing a child's `/proc/<pid>/[ug]id_map` is what `newuidmap` and
//! `newgidmap` exist for, but depending on external setuid binaries is not
//! an option here, so their behavior is reimplemented: the map the user
//! asked for is checked against the ranges delegated to the caller in
//! `/etc/sub[ug]id` (the caller's own id is always implicitly mappable),
//! and the result is sliced up according to the caller's current
//! `/proc/self/[ug]id_map` so the kernel accepts the ids from this writer.
//!
//! [`resolve`] is pure: it combines already-loaded maps and never touches
//! the child's procfs files. The one-shot write itself lives in the outer
//! helper, which is the only process holding the right credentials.

use std::fs;
use std::io;
use std::path::Path;

use nix::unistd::{Gid, Group, Uid, User};
use thiserror::Error;

/// Maximum number of lines the kernel accepts in an id-map file.
pub const MAX_USER_MAPPINGS: usize = 340;

/// Upper bound on the serialized map. 340 mappings of three 10-digit ids
/// stay well below this.
pub const ID_MAP_MAX: usize = 4 * 4096;

#[derive(Debug, Error)]
pub enum IdMapError {
    #[error("open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("{path}:{line}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: &'static str,
    },

    #[error("more than {} id mappings", MAX_USER_MAPPINGS)]
    TooManyMappings,

    #[error("id range end overflows the 32-bit id space")]
    RangeOverflow,

    #[error("id map contains overlapping ranges")]
    OverlappingRanges,

    #[error("too many {which}s to map")]
    TooManyIds { which: &'static str },

    #[error("cannot map desired {which} map: some {which}s are not in the {which}s allowed in {subid_path}")]
    NotAllowed {
        which: &'static str,
        subid_path: String,
    },

    #[error("id map does not fit in {} bytes", ID_MAP_MAX)]
    MapTooLarge,
}

/// A host user or group identity: numeric id plus the account name when the
/// user database can resolve it. Subid entries may use either form.
#[derive(Debug, Clone)]
pub struct Id {
    pub num: u32,
    pub name: Option<String>,
}

impl Id {
    pub fn current_user() -> Id {
        let uid = Uid::current();
        let name = User::from_uid(uid).ok().flatten().map(|u| u.name);
        Id {
            num: uid.as_raw(),
            name,
        }
    }

    pub fn current_group() -> Id {
        let gid = Gid::current();
        let name = Group::from_gid(gid).ok().flatten().map(|g| g.name);
        Id {
            num: gid.as_raw(),
            name,
        }
    }

    fn matches(&self, owner: &str) -> bool {
        if self.name.as_deref() == Some(owner) {
            return true;
        }
        owner.parse::<u32>().is_ok_and(|n| n == self.num)
    }
}

/// One contiguous mapping: `length` consecutive ids starting at `inner`
/// inside the child namespace and at `outer` in the caller's view.
/// `length == 0` means the range is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub inner: u32,
    pub outer: u32,
    pub length: u32,
}

/// Field to order ranges by during [`IdMap::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Inner,
    Outer,
}

impl SortKey {
    /// (sort field, other field) of a range.
    fn fields(self, r: IdRange) -> (u32, u32) {
        match self {
            SortKey::Inner => (r.inner, r.outer),
            SortKey::Outer => (r.outer, r.inner),
        }
    }
}

/// An ordered set of [`IdRange`]s, bounded by [`MAX_USER_MAPPINGS`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    ranges: Vec<IdRange>,
}

impl IdMap {
    pub fn new() -> IdMap {
        IdMap { ranges: Vec::new() }
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = IdRange>) -> Result<IdMap, IdMapError> {
        let mut map = IdMap::new();
        for r in ranges {
            map.push(r)?;
        }
        Ok(map)
    }

    /// Append a range. Range ends must stay representable so that later
    /// arithmetic on `[start, start + length)` cannot wrap.
    pub fn push(&mut self, range: IdRange) -> Result<(), IdMapError> {
        if range.inner.checked_add(range.length).is_none()
            || range.outer.checked_add(range.length).is_none()
        {
            return Err(IdMapError::RangeOverflow);
        }
        if self.ranges.len() == MAX_USER_MAPPINGS {
            return Err(IdMapError::TooManyMappings);
        }
        self.ranges.push(range);
        Ok(())
    }

    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    /// True iff no range covers any id.
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().all(|r| r.length == 0)
    }

    /// Total ids covered, or `None` when the sum exceeds `u32::MAX`.
    pub fn count(&self) -> Option<u32> {
        self.ranges
            .iter()
            .try_fold(0u32, |acc, r| acc.checked_add(r.length))
    }

    /// Sort by `key`, drop empty ranges and exact duplicates, and (when
    /// `merge` is set) coalesce ranges that are adjacent or overlapping in
    /// the sort field, provided the other field lines up. Overlaps that
    /// cannot be coalesced are an error: such a map is ill-formed.
    pub fn normalize(&mut self, key: SortKey, merge: bool) -> Result<(), IdMapError> {
        self.ranges.retain(|r| r.length > 0);
        match key {
            SortKey::Inner => self.ranges.sort_by_key(|r| (r.inner, r.outer, r.length)),
            SortKey::Outer => self.ranges.sort_by_key(|r| (r.outer, r.inner, r.length)),
        }
        self.ranges.dedup();

        let mut out: Vec<IdRange> = Vec::with_capacity(self.ranges.len());
        for r in std::mem::take(&mut self.ranges) {
            let mut absorbed = false;
            if let Some(prev) = out.last_mut() {
                let (pk, po) = key.fields(*prev);
                let (rk, ro) = key.fields(r);
                let prev_end = pk as u64 + prev.length as u64;
                // r continues prev exactly when the offset between the two
                // fields is the same in both ranges.
                let aligned = ro as u64 + pk as u64 == po as u64 + rk as u64;
                if (rk as u64) < prev_end {
                    if !(merge && aligned) {
                        return Err(IdMapError::OverlappingRanges);
                    }
                    let r_end = rk as u64 + r.length as u64;
                    if r_end > prev_end {
                        prev.length = (r_end - pk as u64) as u32;
                    }
                    absorbed = true;
                } else if merge && aligned && rk as u64 == prev_end {
                    prev.length += r.length;
                    absorbed = true;
                }
            }
            if !absorbed {
                out.push(r);
            }
        }
        self.ranges = out;
        Ok(())
    }

    /// Intersect-and-relocate through `view`.
    ///
    /// Every portion of a range whose `outer` ids fall inside some view
    /// range survives, with `outer` rewritten into the view's `inner`
    /// space; portions covered by no view range are dropped.
    pub fn project(&self, view: &IdMap) -> Result<IdMap, IdMapError> {
        let mut out = IdMap::new();
        for r in &self.ranges {
            if r.length == 0 {
                continue;
            }
            let r_start = r.outer as u64;
            let r_end = r_start + r.length as u64;
            for s in &view.ranges {
                if s.length == 0 {
                    continue;
                }
                let s_start = s.outer as u64;
                let s_end = s_start + s.length as u64;
                let lo = r_start.max(s_start);
                let hi = r_end.min(s_end);
                if lo >= hi {
                    continue;
                }
                out.push(IdRange {
                    inner: (r.inner as u64 + (lo - r_start)) as u32,
                    outer: (s.inner as u64 + (lo - s_start)) as u32,
                    length: (hi - lo) as u32,
                })?;
            }
        }
        Ok(out)
    }

    /// Default map when the user asked for nothing specific: the caller's
    /// own id pinned to inner 0, then successive inner ids covering each
    /// subordinate allocation.
    pub fn generate(subids: &IdMap, id: &Id) -> Result<IdMap, IdMapError> {
        let mut out = IdMap::new();
        out.push(IdRange {
            inner: 0,
            outer: id.num,
            length: 1,
        })?;
        let mut next_inner: u32 = 1;
        for r in &subids.ranges {
            if r.length == 0 {
                continue;
            }
            let inner = next_inner;
            next_inner = inner
                .checked_add(r.length)
                .ok_or(IdMapError::TooManyIds { which: "id" })?;
            out.push(IdRange {
                inner,
                outer: r.outer,
                length: r.length,
            })?;
        }
        Ok(out)
    }

    /// Rewrite every range to map its outer ids onto themselves.
    pub fn identity_view(&mut self) {
        for r in &mut self.ranges {
            r.inner = r.outer;
        }
    }

    /// Serialize in the `/proc/<pid>/[ug]id_map` line format.
    pub fn format(&self) -> Result<String, IdMapError> {
        let mut buf = String::new();
        for r in &self.ranges {
            if r.length == 0 {
                continue;
            }
            buf.push_str(&format!("{} {} {}\n", r.inner, r.outer, r.length));
            if buf.len() >= ID_MAP_MAX {
                return Err(IdMapError::MapTooLarge);
            }
        }
        Ok(buf)
    }

    /// Parse `inner outer length` lines (the `/proc` id-map format).
    /// `path` only labels diagnostics.
    pub fn parse(text: &str, path: &str) -> Result<IdMap, IdMapError> {
        let mut map = IdMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let malformed = || IdMapError::Parse {
                path: path.to_owned(),
                line: idx + 1,
                reason: "malformed id map entry",
            };
            let mut fields = line.split_whitespace();
            let (Some(inner), Some(outer), Some(length), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(malformed());
            };
            let inner: u32 = inner.parse().map_err(|_| malformed())?;
            let outer: u32 = outer.parse().map_err(|_| malformed())?;
            let length: u32 = length.parse().map_err(|_| malformed())?;
            if inner.checked_add(length).is_none() || outer.checked_add(length).is_none() {
                return Err(IdMapError::Parse {
                    path: path.to_owned(),
                    line: idx + 1,
                    reason: "id range overflows the 32-bit id space",
                });
            }
            map.push(IdRange {
                inner,
                outer,
                length,
            })?;
        }
        Ok(map)
    }
}

/// Load a `/proc/<pid>/[ug]id_map` file.
pub fn load_procids(path: impl AsRef<Path>) -> Result<IdMap, IdMapError> {
    let path = path.as_ref();
    let label = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| IdMapError::Open {
        path: label.clone(),
        source: e,
    })?;
    IdMap::parse(&text, &label)
}

/// Load the subordinate ranges delegated to `id` from an `/etc/sub[ug]id`
/// style file: `owner:start:count` per line, `#` comments and blank lines
/// ignored, owner matched by name or numeric id. Entries for other owners
/// are skipped, but every entry must still parse.
///
/// A missing file is an empty allocation set; the caller's own id stays
/// implicitly mappable.
pub fn load_subids(path: impl AsRef<Path>, id: &Id) -> Result<IdMap, IdMapError> {
    let path = path.as_ref();
    let label = path.display().to_string();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(IdMap::new()),
        Err(e) => {
            return Err(IdMapError::Open {
                path: label,
                source: e,
            })
        }
    };

    let mut map = IdMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || IdMapError::Parse {
            path: label.clone(),
            line: idx + 1,
            reason: "malformed subordinate id entry",
        };
        let mut fields = line.split(':');
        let (Some(owner), Some(start), Some(count), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };
        let start: u32 = start.parse().map_err(|_| malformed())?;
        let count: u32 = count.parse().map_err(|_| malformed())?;
        if start.checked_add(count).is_none() {
            return Err(IdMapError::Parse {
                path: label.clone(),
                line: idx + 1,
                reason: "subordinate id range overflows the 32-bit id space",
            });
        }
        if !id.matches(owner) {
            continue;
        }
        map.push(IdRange {
            inner: 0,
            outer: start,
            length: count,
        })?;
    }
    Ok(map)
}

/// Combine the requested map, the caller's subordinate allocations and the
/// caller's current id map into the text destined for the child's map file.
///
/// With a non-empty `desired`, the subid ranges act as the permission set:
/// `desired` is projected onto them (taken as an identity view so the
/// surviving outer ids keep their caller-relative values), and any shortfall
/// in the covered count means the user asked for ids they do not own. With
/// an empty `desired`, a default map is generated instead. Either result is
/// finally projected through `cur_id_map`, slicing it to the portions the
/// caller's namespace can express.
pub fn resolve(
    which: &'static str,
    subid_path: &str,
    desired: &IdMap,
    subids: IdMap,
    cur_id_map: IdMap,
    id: &Id,
) -> Result<String, IdMapError> {
    // The caller's own map files should be well-formed, but enforce that
    // rather than blindly trust.
    let mut cur_id_map = cur_id_map;
    cur_id_map.normalize(SortKey::Outer, false)?;

    let mut subids = subids;
    subids.normalize(SortKey::Outer, true)?;

    let map = if !desired.is_empty() {
        subids.identity_view();

        let mut desired = desired.clone();
        desired.normalize(SortKey::Outer, true)?;

        let projected = desired.project(&subids)?;
        let permitted = projected
            .count()
            .ok_or(IdMapError::TooManyIds { which })?;
        let wanted = desired.count().ok_or(IdMapError::TooManyIds { which })?;
        if permitted != wanted {
            return Err(IdMapError::NotAllowed {
                which,
                subid_path: subid_path.to_owned(),
            });
        }
        projected
    } else {
        IdMap::generate(&subids, id)?
    };

    map.project(&cur_id_map)?.format()
}

/// Resolve the uid map for the calling process.
pub fn resolve_uid_map(desired: &IdMap) -> Result<String, IdMapError> {
    let id = Id::current_user();
    let subids = load_subids("/etc/subuid", &id)?;
    let cur = load_procids("/proc/self/uid_map")?;
    resolve("uid", "/etc/subuid", desired, subids, cur, &id)
}

/// Resolve the gid map for the calling process.
pub fn resolve_gid_map(desired: &IdMap) -> Result<String, IdMapError> {
    let id = Id::current_group();
    let subids = load_subids("/etc/subgid", &id)?;
    let cur = load_procids("/proc/self/gid_map")?;
    resolve("gid", "/etc/subgid", desired, subids, cur, &id)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn id(num: u32, name: &str) -> Id {
        Id {
            num,
            name: Some(name.to_owned()),
        }
    }

    fn range(inner: u32, outer: u32, length: u32) -> IdRange {
        IdRange {
            inner,
            outer,
            length,
        }
    }

    fn identity_procmap() -> IdMap {
        IdMap::parse("0 0 4294967295", "/proc/self/uid_map").unwrap()
    }

    fn subid_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn default_map_pins_caller_then_subids() {
        let f = subid_file("1000:100000:65536\n");
        let caller = id(1000, "user");
        let subids = load_subids(f.path(), &caller).unwrap();

        let out = resolve(
            "uid",
            "/etc/subuid",
            &IdMap::new(),
            subids,
            identity_procmap(),
            &caller,
        )
        .unwrap();
        assert_eq!(out, "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn desired_outside_subids_is_refused() {
        let f = subid_file("1000:100000:65536\n");
        let caller = id(1000, "user");
        let subids = load_subids(f.path(), &caller).unwrap();

        let desired =
            IdMap::from_ranges([range(0, 0, 1), range(1, 1, 10)]).unwrap();
        let err = resolve(
            "uid",
            "/etc/subuid",
            &desired,
            subids,
            identity_procmap(),
            &caller,
        )
        .unwrap_err();
        assert!(matches!(err, IdMapError::NotAllowed { which: "uid", .. }));
        assert!(err
            .to_string()
            .contains("not in the uids allowed in /etc/subuid"));
    }

    #[test]
    fn desired_inside_subids_is_kept_whole() {
        let f = subid_file("1000:100000:65536\n");
        let caller = id(1000, "user");
        let subids = load_subids(f.path(), &caller).unwrap();

        let desired = IdMap::from_ranges([range(0, 100000, 1000)]).unwrap();
        let out = resolve(
            "uid",
            "/etc/subuid",
            &desired,
            subids,
            identity_procmap(),
            &caller,
        )
        .unwrap();
        assert_eq!(out, "0 100000 1000\n");
    }

    #[test]
    fn format_parse_round_trip() {
        let mut map =
            IdMap::from_ranges([range(1, 100000, 65536), range(0, 1000, 1)]).unwrap();
        map.normalize(SortKey::Inner, false).unwrap();

        let text = map.format().unwrap();
        let mut reparsed = IdMap::parse(&text, "round-trip").unwrap();
        reparsed.normalize(SortKey::Inner, false).unwrap();
        assert_eq!(map, reparsed);
    }

    #[test]
    fn normalize_rejects_overlap() {
        let mut map = IdMap::from_ranges([range(0, 0, 10), range(5, 100, 10)]).unwrap();
        assert!(matches!(
            map.clone().normalize(SortKey::Inner, false),
            Err(IdMapError::OverlappingRanges)
        ));
        // Misaligned overlap is not mergeable either.
        assert!(matches!(
            map.normalize(SortKey::Inner, true),
            Err(IdMapError::OverlappingRanges)
        ));
    }

    #[test]
    fn normalize_merges_adjacent_aligned_ranges() {
        let mut map =
            IdMap::from_ranges([range(5, 1005, 5), range(0, 1000, 5), range(20, 40, 0)])
                .unwrap();
        map.normalize(SortKey::Inner, true).unwrap();
        assert_eq!(map.ranges(), &[range(0, 1000, 10)]);
    }

    #[test]
    fn normalize_inner_leaves_disjoint_inner_ids() {
        let mut map =
            IdMap::from_ranges([range(10, 0, 5), range(0, 500, 5), range(5, 900, 5)]).unwrap();
        map.normalize(SortKey::Inner, false).unwrap();
        for pair in map.ranges().windows(2) {
            assert!(pair[0].inner + pair[0].length <= pair[1].inner);
        }
    }

    #[test]
    fn project_clips_and_relocates() {
        let map = IdMap::from_ranges([range(0, 1000, 100)]).unwrap();
        let view = IdMap::from_ranges([range(500000, 1050, 10)]).unwrap();
        let out = map.project(&view).unwrap();
        assert_eq!(out.ranges(), &[range(50, 500000, 10)]);
    }

    #[test]
    fn project_composes() {
        // Projecting through a then b equals projecting through their
        // composition.
        fn swapped(m: &IdMap) -> IdMap {
            IdMap::from_ranges(m.ranges().iter().map(|r| IdRange {
                inner: r.outer,
                outer: r.inner,
                length: r.length,
            }))
            .unwrap()
        }

        let m = IdMap::from_ranges([range(0, 100, 50), range(50, 300, 20)]).unwrap();
        let a = IdMap::from_ranges([range(1000, 90, 40), range(2000, 290, 40)]).unwrap();
        let b = IdMap::from_ranges([range(7, 1000, 25), range(500, 2000, 100)]).unwrap();

        let two_step = m.project(&a).unwrap().project(&b).unwrap();
        let compose = swapped(&swapped(&a).project(&b).unwrap());
        let one_step = m.project(&compose).unwrap();

        let normalized = |mut x: IdMap| {
            x.normalize(SortKey::Inner, true).unwrap();
            x
        };
        assert_eq!(normalized(two_step), normalized(one_step));
    }

    #[test]
    fn count_overflow_is_detected() {
        let map =
            IdMap::from_ranges([range(0, 0, u32::MAX), range(10, 10, 1)]).unwrap();
        assert_eq!(map.count(), None);
    }

    #[test]
    fn push_rejects_wrapping_range() {
        let mut map = IdMap::new();
        assert!(matches!(
            map.push(range(u32::MAX, 0, 2)),
            Err(IdMapError::RangeOverflow)
        ));
    }

    #[test]
    fn subids_skip_comments_and_other_owners() {
        let f = subid_file(
            "# managed by hand\n\nroot:1:999\n1000:100000:65536\nuser:200000:1000\n",
        );
        let subids = load_subids(f.path(), &id(1000, "user")).unwrap();
        assert_eq!(
            subids.ranges(),
            &[range(0, 100000, 65536), range(0, 200000, 1000)]
        );
    }

    #[test]
    fn subid_overflow_is_rejected_at_load() {
        let f = subid_file("1000:4294967295:2\n");
        let err = load_subids(f.path(), &id(1000, "user")).unwrap_err();
        assert!(matches!(err, IdMapError::Parse { .. }));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn malformed_subid_line_fails_even_for_other_owner() {
        let f = subid_file("root:not-a-number:10\n1000:100000:65536\n");
        assert!(load_subids(f.path(), &id(1000, "user")).is_err());
    }

    #[test]
    fn missing_subid_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let subids = load_subids(dir.path().join("subuid"), &id(1000, "user")).unwrap();
        assert!(subids.is_empty());
    }

    #[test]
    fn empty_subids_still_map_the_caller() {
        let caller = id(1000, "user");
        let out = resolve(
            "uid",
            "/etc/subuid",
            &IdMap::new(),
            IdMap::new(),
            identity_procmap(),
            &caller,
        )
        .unwrap();
        assert_eq!(out, "0 1000 1\n");
    }

    #[test]
    fn ill_formed_current_map_is_rejected() {
        let cur = IdMap::from_ranges([range(0, 0, 10), range(100, 5, 10)]).unwrap();
        let err = resolve(
            "uid",
            "/etc/subuid",
            &IdMap::new(),
            IdMap::new(),
            cur,
            &id(1000, "user"),
        )
        .unwrap_err();
        assert!(matches!(err, IdMapError::OverlappingRanges));
    }
}
