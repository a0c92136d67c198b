//! Reading and writing the archives classes come in
//!
//! An [`Archive`] is an ordered list of named entries. Entries are kept as raw bytes; deciding
//! which of them are classes is left to the engine (see [`Entry::looks_like_class`]). Paths ending
//! in `.class` are read as an archive with a single entry and written back as a bare class file.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::Path;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const CLASS_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("duplicate entry {0:?}")]
    DuplicateEntry(String),

    #[error("a single class input must produce exactly one entry, not {0}")]
    NotASingleClass(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path inside the archive, using `/` separators (directories end with `/`)
    pub name: String,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Entry {
        Entry {
            name: name.into(),
            data,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Named like a class file and starting with the class file magic number
    ///
    /// Anything else is a resource and is written back untouched.
    pub fn looks_like_class(&self) -> bool {
        self.name.ends_with(".class") && self.data.starts_with(&CLASS_MAGIC)
    }

    /// Signature block of a signed jar (`META-INF/*.SF`, `*.RSA`, `*.DSA`, or `*.EC`)
    pub fn is_signature_file(&self) -> bool {
        let file_name = match self.name.strip_prefix("META-INF/") {
            Some(file_name) if !file_name.contains('/') => file_name,
            _ => return false,
        };
        [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|extension| file_name.to_ascii_uppercase().ends_with(extension))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    pub entries: Vec<Entry>,

    /// Read from a bare `.class` file (and so written back as one)
    pub single_class: bool,
}

impl Archive {
    pub fn new(entries: Vec<Entry>) -> Archive {
        Archive {
            entries,
            single_class: false,
        }
    }

    /// Read a jar (or zip), or a single `.class` file
    pub fn read(path: &Path) -> Result<Archive, ArchiveError> {
        if is_class_path(path) {
            let data = fs::read(path)?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| String::from("input.class"));
            return Ok(Archive {
                entries: vec![Entry::new(name, data)],
                single_class: true,
            });
        }
        log::info!("Reading archive '{}'", path.display());
        Archive::from_reader(fs::File::open(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Archive, ArchiveError> {
        Archive::from_reader(Cursor::new(bytes))
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Archive, ArchiveError> {
        let mut zip = ZipArchive::new(reader)?;
        let mut entries = Vec::with_capacity(zip.len());
        let mut names = HashSet::new();
        for index in 0..zip.len() {
            let mut file = zip.by_index(index)?;
            let name = file.name().to_owned();
            if !names.insert(name.clone()) {
                return Err(ArchiveError::DuplicateEntry(name));
            }
            let mut data = Vec::with_capacity(file.size() as usize);
            if !file.is_dir() {
                file.read_to_end(&mut data)?;
            }
            entries.push(Entry { name, data });
        }
        Ok(Archive::new(entries))
    }

    /// Write to `path`, as a bare class file if the archive was read from one
    pub fn write(&self, path: &Path) -> Result<(), ArchiveError> {
        if self.single_class {
            return match self.entries.as_slice() {
                [entry] => Ok(fs::write(path, &entry.data)?),
                entries => Err(ArchiveError::NotASingleClass(entries.len())),
            };
        }
        log::info!("Writing archive '{}'", path.display());
        self.to_writer(fs::File::create(path)?)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        Ok(self.to_writer(Cursor::new(vec![]))?.into_inner())
    }

    pub fn to_writer<W: Write + Seek>(&self, writer: W) -> Result<W, ArchiveError> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(writer);
        let mut names = HashSet::new();
        for entry in &self.entries {
            if !names.insert(entry.name.as_str()) {
                return Err(ArchiveError::DuplicateEntry(entry.name.clone()));
            }
            if entry.is_dir() {
                zip.add_directory(entry.name.as_str(), options)?;
            } else {
                zip.start_file(entry.name.as_str(), options)?;
                zip.write_all(&entry.data)?;
            }
        }
        Ok(zip.finish()?)
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Remove the signature files of a signed jar, returning how many there were
    pub fn strip_signatures(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.is_signature_file());
        let removed = before - self.entries.len();
        if removed > 0 {
            log::info!("Removed {} signature files", removed);
        }
        removed
    }
}

fn is_class_path(path: &Path) -> bool {
    path.extension()
        .map_or(false, |extension| extension.eq_ignore_ascii_case("class"))
}

#[cfg(test)]
mod test {
    use super::*;

    fn class_bytes() -> Vec<u8> {
        vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52]
    }

    #[test]
    fn entries_survive_a_round_trip() {
        let archive = Archive::new(vec![
            Entry::new("META-INF/", vec![]),
            Entry::new("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec()),
            Entry::new("a/A.class", class_bytes()),
            Entry::new("a/data.bin", vec![1, 2, 3]),
        ]);
        let bytes = archive.to_bytes().unwrap();
        assert_eq!(Archive::from_bytes(&bytes).unwrap(), archive);
    }

    #[test]
    fn classes_need_name_and_magic() {
        assert!(Entry::new("a/A.class", class_bytes()).looks_like_class());
        assert!(!Entry::new("a/A.class", vec![1, 2, 3, 4]).looks_like_class());
        assert!(!Entry::new("a/A.bin", class_bytes()).looks_like_class());
    }

    #[test]
    fn signatures_are_stripped() {
        let mut archive = Archive::new(vec![
            Entry::new("META-INF/MANIFEST.MF", vec![]),
            Entry::new("META-INF/CERT.SF", vec![]),
            Entry::new("META-INF/CERT.RSA", vec![]),
            Entry::new("META-INF/maven/a/pom.xml", vec![]),
            Entry::new("a/A.class", class_bytes()),
        ]);
        assert_eq!(archive.strip_signatures(), 2);
        assert_eq!(archive.entries.len(), 3);
        assert!(archive.get("META-INF/CERT.SF").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let archive = Archive::new(vec![
            Entry::new("a/A.class", class_bytes()),
            Entry::new("a/A.class", class_bytes()),
        ]);
        assert!(matches!(
            archive.to_bytes(),
            Err(ArchiveError::DuplicateEntry(name)) if name == "a/A.class"
        ));
    }

    #[test]
    fn single_classes_read_and_write_bare() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("A.class");
        fs::write(&input, class_bytes()).unwrap();

        let archive = Archive::read(&input).unwrap();
        assert!(archive.single_class);
        assert_eq!(archive.entries, vec![Entry::new("A.class", class_bytes())]);

        let output = dir.path().join("B.class");
        archive.write(&output).unwrap();
        assert_eq!(fs::read(&output).unwrap(), class_bytes());
    }
}
