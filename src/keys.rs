//! Key-file and nonce-prefix-file parsing. Both are opaque, externally
//! managed files; this module only decodes their fixed format.

use std::path::Path;

use anyhow::{bail, Context, Result};
use zeroize::Zeroize;

/// A 32-byte key, zeroized on drop. Used for both our secret key and the
/// peer's public key before they're handed to the crypto layer.
#[derive(Clone)]
pub struct KeyBytes(pub [u8; 32]);

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Parse a key file: one line of exactly 64 hex characters (either case)
/// followed by a newline, decoding to 32 bytes. Any deviation is a fatal
/// startup error.
pub fn read_key_file(path: &Path) -> Result<KeyBytes> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    let line = contents.strip_suffix('\n').unwrap_or(&contents);
    if line.len() != 64 {
        bail!(
            "key file {} must contain exactly 64 hex characters, got {}",
            path.display(),
            line.len()
        );
    }
    let decoded = hex::decode(line)
        .with_context(|| format!("key file {} is not valid hex", path.display()))?;
    let arr: [u8; 32] = decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file {} did not decode to 32 bytes", path.display()))?;
    Ok(KeyBytes(arr))
}

/// Read the nonce-prefix file, increment it, write it back, and return the
/// incremented value to use as this run's 4-byte prefix. 0 is reserved for
/// "uninitialized"; a starting or resulting value of 0 is a fatal error.
pub fn bump_nonce_prefix(path: &Path) -> Result<[u8; 4]> {
    let raw = std::fs::read(path)
        .with_context(|| format!("reading nonce-prefix file {}", path.display()))?;
    if raw.len() != 4 {
        bail!(
            "nonce-prefix file {} must be exactly 4 bytes, got {}",
            path.display(),
            raw.len()
        );
    }
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&raw);
    let current = u32::from_be_bytes(arr);

    let next = current
        .checked_add(1)
        .filter(|&n| n != 0)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "nonce-prefix file {} would overflow to the reserved value 0",
                path.display()
            )
        })?;

    std::fs::write(path, next.to_be_bytes())
        .with_context(|| format!("writing nonce-prefix file {}", path.display()))?;

    Ok(next.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn tmp_file(contents: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f
    }

    #[test]
    fn parses_valid_key_file() {
        let hex_line = "ab".repeat(32);
        let f = tmp_file(format!("{hex_line}\n").as_bytes());
        let key = read_key_file(f.path()).unwrap();
        assert_eq!(key.0, [0xabu8; 32]);
    }

    #[test]
    fn parses_uppercase_key_file() {
        let hex_line = "AB".repeat(32);
        let f = tmp_file(format!("{hex_line}\n").as_bytes());
        let key = read_key_file(f.path()).unwrap();
        assert_eq!(key.0, [0xabu8; 32]);
    }

    #[test]
    fn rejects_wrong_length() {
        let f = tmp_file(b"deadbeef\n");
        assert!(read_key_file(f.path()).is_err());
    }

    #[test]
    fn rejects_non_hex() {
        let line = "zz".repeat(32);
        let f = tmp_file(format!("{line}\n").as_bytes());
        assert!(read_key_file(f.path()).is_err());
    }

    #[test]
    fn bumps_prefix_and_persists() {
        let f = tmp_file(&0u32.to_be_bytes());
        let prefix = bump_nonce_prefix(f.path()).unwrap();
        assert_eq!(u32::from_be_bytes(prefix), 1);
        let on_disk = std::fs::read(f.path()).unwrap();
        assert_eq!(on_disk, 1u32.to_be_bytes());
    }

    #[test]
    fn refuses_overflow_to_reserved_zero() {
        let f = tmp_file(&u32::MAX.to_be_bytes());
        assert!(bump_nonce_prefix(f.path()).is_err());
    }

    #[test]
    fn rejects_wrong_size_prefix_file() {
        let f = tmp_file(b"abc");
        assert!(bump_nonce_prefix(f.path()).is_err());
    }
}
