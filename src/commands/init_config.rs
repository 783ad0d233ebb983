use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;

use crate::config::{default_config_path, expand_home, template_yaml};
use crate::utils::write_atomically;

/// Write the commented default configuration to `path` or the default location
pub fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let target = path.map(expand_home).unwrap_or_else(default_config_path);
    if target.exists() && !force {
        bail!(
            "{} already exists, use --force to overwrite it",
            target.display()
        );
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    write_atomically(&target, |file| file.write_all(template_yaml().as_bytes()))
        .with_context(|| format!("Failed to write {}", target.display()))?;

    println!("Wrote {}", target.display());
    println!("Edit the paths section, then run `vw-explorer process`");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.yml");
        init_config(Some(&path), false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(Config::from_yaml(&written).is_ok());

        assert!(init_config(Some(&path), false).is_err());
        init_config(Some(&path), true).unwrap();
    }
}
