//! Long-term identity key on disk.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

use intermaster_core::IdentityKeypair;

/// Load the 32-byte seed at `path`, or generate one and write it there.
pub fn load_or_generate(path: &Path) -> Result<IdentityKeypair> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("{} is not a 32-byte key seed", path.display()))?;
            Ok(IdentityKeypair::from_seed(seed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = IdentityKeypair::generate();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            std::fs::write(path, keypair.seed().as_slice())
                .with_context(|| format!("failed to write {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                    .with_context(|| format!("failed to restrict {}", path.display()))?;
            }
            tracing::info!(path = %path.display(), "generated new identity key");
            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("intermasterd-{}-{name}", std::process::id()))
            .join("identity.key")
    }

    #[test]
    fn generated_key_is_reloaded() {
        let path = scratch("reload");
        let _ = std::fs::remove_file(&path);

        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.identity(), second.identity());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn truncated_seed_is_an_error() {
        let path = scratch("short");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [0u8; 7]).unwrap();

        assert!(load_or_generate(&path).is_err());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
