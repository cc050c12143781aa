//! Persisted configuration file.
//!
//! The store is a TOML file with one table per section. A missing file reads
//! as empty so that every setting takes its default. Writes re-read the file,
//! update the given keys and write the whole document back; comments in the
//! file are not preserved.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    config::Settings,
    error::{Error, Result},
};

#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and parses every section.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, or when its
    /// contents are not valid TOML or have values of the wrong type.
    pub fn settings(&self) -> Result<Settings> {
        let table = self.read()?;
        let settings = toml::Value::Table(table).try_into()?;
        Ok(settings)
    }

    /// Sets `updates` in `section` and writes the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written, or if
    /// `section` exists but is not a table.
    pub fn update(&self, section: &str, updates: &[(&str, toml::Value)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut table = self.read()?;
        let section_table = table
            .entry(section)
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| {
                Error::failed_precondition(format!(
                    "[{section}] in {} is not a table",
                    self.path.display()
                ))
            })?;

        for (key, value) in updates {
            section_table.insert((*key).to_owned(), value.clone());
        }

        let contents = toml::to_string_pretty(&table)?;
        fs::write(&self.path, contents)?;

        debug!(
            "saved {} setting(s) to [{section}] in {}",
            updates.len(),
            self.path.display()
        );
        Ok(())
    }

    fn read(&self) -> Result<toml::Table> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.parse::<toml::Table>()?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", self.path.display());
                Ok(toml::Table::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}
