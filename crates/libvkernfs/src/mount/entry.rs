//! One line of `/proc/<pid>/mountinfo`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::VkernError;
use crate::Result;

/// Propagation keys a mountinfo line may carry between the mount options and
/// the `-` separator. Anything else is a malformed line.
const PROPAGATION_KEYS: &[&str] = &["shared", "master", "propagate_from", "unbindable"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    /// Device identifier, `major:minor`.
    pub dev: String,
    pub root: String,
    pub mountpoint: PathBuf,
    pub fs_type: String,
    pub source: String,
    /// Per-mountpoint options. Values default to empty.
    pub options: HashMap<String, String>,
    /// Superblock options.
    pub vfs_options: HashMap<String, String>,
    /// Propagation fields, e.g. `shared` -> `"5"`.
    pub propagation: HashMap<String, String>,
    /// Filled on demand by the bulk inode resolution pass.
    pub mountpoint_ino: Option<u64>,
}

impl MountEntry {
    pub fn parse_line(line: &str) -> Result<MountEntry> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // id, parent, dev, root, mountpoint, options, separator, fstype,
        // source, vfs options.
        if fields.len() < 10 {
            return Err(malformed(line));
        }

        let sep = fields[6..]
            .iter()
            .position(|f| *f == "-")
            .map(|i| i + 6)
            .ok_or_else(|| malformed(line))?;
        if fields.len() < sep + 4 {
            return Err(malformed(line));
        }

        let mount_id = parse_id(fields[0], line)?;
        let parent_id = parse_id(fields[1], line)?;

        let mut propagation = HashMap::new();
        for field in &fields[6..sep] {
            let (key, value) = split_once_eq(field, ':');
            if !PROPAGATION_KEYS.contains(&key) {
                return Err(VkernError::Invalid(format!(
                    "unknown propagation field {field} in mountinfo line: {line}"
                )));
            }
            propagation.insert(key.to_string(), value.to_string());
        }

        Ok(MountEntry {
            mount_id,
            parent_id,
            dev: fields[2].to_string(),
            root: fields[3].to_string(),
            mountpoint: PathBuf::from(fields[4]),
            fs_type: fields[sep + 1].to_string(),
            source: fields[sep + 2].to_string(),
            options: parse_options(fields[5]),
            vfs_options: parse_options(fields[sep + 3]),
            propagation,
            mountpoint_ino: None,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.options.contains_key("ro")
    }

    /// Mount options with `ro`/`rw` stripped, for flag comparisons that must
    /// ignore writability.
    pub fn options_minus_rw(&self) -> HashMap<String, String> {
        let mut opts = self.options.clone();
        opts.remove("ro");
        opts.remove("rw");
        opts
    }
}

fn malformed(line: &str) -> VkernError {
    VkernError::Invalid(format!("malformed mountinfo line: {line}"))
}

fn parse_id(field: &str, line: &str) -> Result<u32> {
    field
        .parse::<u32>()
        .map_err(|_| VkernError::Invalid(format!("bad mount id {field} in line: {line}")))
}

/// Comma-separated `key[=value]` list. A value containing `=` loses its tail;
/// only the first two pieces are kept.
fn parse_options(field: &str) -> HashMap<String, String> {
    let mut opts = HashMap::new();
    for token in field.split(',') {
        if token.is_empty() {
            continue;
        }
        let (key, value) = split_once_eq(token, '=');
        opts.insert(key.to_string(), value.to_string());
    }
    opts
}

fn split_once_eq(token: &str, sep: char) -> (&str, &str) {
    match token.split_once(sep) {
        Some((key, value)) => (key, value.split(sep).next().unwrap_or("")),
        None => (token, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_proc_line() -> anyhow::Result<()> {
        let entry = MountEntry::parse_line("42 41 0:22 / /proc rw - proc proc rw")?;
        assert_eq!(entry.mount_id, 42);
        assert_eq!(entry.parent_id, 41);
        assert_eq!(entry.dev, "0:22");
        assert_eq!(entry.root, "/");
        assert_eq!(entry.mountpoint, PathBuf::from("/proc"));
        assert_eq!(entry.fs_type, "proc");
        assert_eq!(entry.source, "proc");
        assert!(entry.options.contains_key("rw"));
        assert!(entry.propagation.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_propagation_fields() -> anyhow::Result<()> {
        let entry = MountEntry::parse_line(
            "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue",
        )?;
        assert_eq!(entry.propagation.get("master").map(String::as_str), Some("1"));
        assert_eq!(entry.fs_type, "ext3");
        assert_eq!(
            entry.vfs_options.get("errors").map(String::as_str),
            Some("continue")
        );
        Ok(())
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        let err = MountEntry::parse_line("42 41 0:22 / /proc rw proc proc rw extra junk")
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::Invalid(_)));
    }

    #[test]
    fn test_non_integer_id_is_rejected() {
        let err = MountEntry::parse_line("x 41 0:22 / /proc rw - proc proc rw")
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::Invalid(_)));
    }

    #[test]
    fn test_unknown_propagation_key_is_rejected() {
        let err = MountEntry::parse_line("42 41 0:22 / /proc rw sliding:1 - proc proc rw")
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::Invalid(_)));
    }

    #[test]
    fn test_option_value_with_equals_keeps_first_two_pieces() -> anyhow::Result<()> {
        let entry = MountEntry::parse_line(
            "50 41 0:30 / /data rw,ctx=system_u=r - tmpfs tmpfs rw",
        )?;
        // "ctx=system_u=r" splits to key "ctx" and value "system_u".
        assert_eq!(entry.options.get("ctx").map(String::as_str), Some("system_u"));
        Ok(())
    }

    #[test]
    fn test_ro_detection() -> anyhow::Result<()> {
        let entry = MountEntry::parse_line("43 42 0:22 /bus /proc/bus ro - proc proc ro")?;
        assert!(entry.is_read_only());
        assert!(!entry.options_minus_rw().contains_key("ro"));
        Ok(())
    }
}
