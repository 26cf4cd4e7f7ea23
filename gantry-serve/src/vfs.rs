//! A stack of directories presented as one flat filesystem. Reads hit the
//! first layer containing the name; listings merge all layers.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("{name}: not found in any layer")]
    NotFound { name: String },
    #[error("{name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Default)]
pub struct StackedFs {
    layers: Vec<PathBuf>,
}

impl StackedFs {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self { layers: dirs.into_iter().map(Into::into).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Reads `name` from the first layer that has it.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, VfsError> {
        for layer in &self.layers {
            match std::fs::read(layer.join(name)) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(VfsError::Io { name: name.to_owned(), source: err }),
            }
        }
        Err(VfsError::NotFound { name: name.to_owned() })
    }

    /// Top-level file names across all layers: layer order first, name
    /// order within a layer, shadowed duplicates dropped. Missing layer
    /// directories are treated as empty.
    pub fn entries(&self) -> Result<Vec<String>, VfsError> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for layer in &self.layers {
            let entries = match std::fs::read_dir(layer) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(VfsError::Io {
                        name: layer.display().to_string(),
                        source: err,
                    })
                }
            };
            let mut names = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|err| VfsError::Io {
                    name: layer.display().to_string(),
                    source: err,
                })?;
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
            names.sort();
            for name in names {
                if seen.insert(name.clone()) {
                    out.push(name);
                }
            }
        }
        Ok(out)
    }

    /// Names of discoverable descriptor-set files: `*.pb`, excluding names
    /// prefixed with `_`.
    pub fn descriptor_files(&self) -> Result<Vec<String>, VfsError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|n| n.ends_with(".pb") && !n.starts_with('_'))
            .collect())
    }
}
