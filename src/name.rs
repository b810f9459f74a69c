//! Name Protocol (C3): whiteout/opaque encoding and user-visible name
//! validation, spec §4.2 and the bit-exact forms in spec §6.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

/// ASCII `.wh.` — the whiteout prefix, 4 bytes wide.
pub const WHITEOUT_PREFIX: &[u8] = b".wh.";

/// The sentinel file marking a directory opaque.
pub const OPAQUE_MARKER: &[u8] = b".wh.__dir_opaque";

/// True if `name` is reserved for internal bookkeeping: it carries the
/// whiteout prefix, or it is exactly the opacity marker. Per spec §4.2,
/// operations on such names must fail with `PERM` before reaching any lower
/// filesystem (spec §7 "Name violation").
pub fn is_reserved(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes == OPAQUE_MARKER || bytes.starts_with(WHITEOUT_PREFIX)
}

/// Builds the whiteout name `.wh.<name>` for a user-visible `name`.
///
/// Panics if `name` is itself reserved; callers must check
/// [`is_reserved`] on the user-visible name before calling this.
pub fn whiteout_name_for(name: &OsStr) -> OsString {
    debug_assert!(!is_reserved(name), "cannot whiteout a reserved name");
    let mut bytes = Vec::with_capacity(WHITEOUT_PREFIX.len() + name.len());
    bytes.extend_from_slice(WHITEOUT_PREFIX);
    bytes.extend_from_slice(name.as_bytes());
    OsStr::from_bytes(&bytes).to_os_string()
}

/// If `name` is a whiteout name, returns the user-visible name it shadows.
pub fn name_behind_whiteout(name: &OsStr) -> Option<&OsStr> {
    let bytes = name.as_bytes();
    if bytes == OPAQUE_MARKER {
        return None;
    }
    bytes
        .strip_prefix(WHITEOUT_PREFIX)
        .map(OsStr::from_bytes)
}

/// The opacity marker's name, for directory listing filters and creation.
pub fn opaque_marker_name() -> &'static OsStr {
    OsStr::from_bytes(OPAQUE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved(OsStr::new(".wh.foo")));
        assert!(is_reserved(OsStr::new(".wh.__dir_opaque")));
        assert!(!is_reserved(OsStr::new("foo")));
        assert!(!is_reserved(OsStr::new(".wh")));
    }

    #[test]
    fn whiteout_round_trip() {
        let wh = whiteout_name_for(OsStr::new("hello"));
        assert_eq!(wh, OsStr::new(".wh.hello"));
        assert_eq!(
            name_behind_whiteout(&wh).unwrap(),
            OsStr::new("hello")
        );
    }

    #[test]
    fn opaque_marker_is_not_a_whiteout_of_anything() {
        assert_eq!(name_behind_whiteout(OsStr::new(".wh.__dir_opaque")), None);
    }
}
