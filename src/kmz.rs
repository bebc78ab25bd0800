//! KMZ sources. A KMZ is a zip archive holding one KML document.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;

use crate::error::{Error, Result};

pub fn is_kmz(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("kmz"))
}

/// Extracts the KML document of `kmz` into `dest` as `<kmz stem>.kml`.
///
/// `doc.kml` is preferred, then the first `.kml` entry at the archive root,
/// then any `.kml` entry.
pub fn extract_kml(kmz: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::open(kmz)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    let entry = pick_kml(&names).ok_or_else(|| Error::KmzWithoutKml {
        path: kmz.to_path_buf(),
    })?;
    debug!("Using {} from {:?}", entry, kmz);

    let stem = kmz
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("doc");
    let out_path = dest.join(format!("{}.kml", stem));

    let mut zipped = archive.by_name(entry)?;
    let mut out = File::create(&out_path)?;
    io::copy(&mut zipped, &mut out)?;

    Ok(out_path)
}

fn pick_kml(names: &[String]) -> Option<&str> {
    let is_kml = |name: &&String| name.to_ascii_lowercase().ends_with(".kml");

    names
        .iter()
        .find(|name| name.eq_ignore_ascii_case("doc.kml"))
        .or_else(|| names.iter().filter(is_kml).find(|name| !name.contains('/')))
        .or_else(|| names.iter().find(is_kml))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_kmz(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_pick_kml_preference() {
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(
            pick_kml(&names(&["files/a.kml", "wells.kml", "doc.kml"])),
            Some("doc.kml")
        );
        assert_eq!(
            pick_kml(&names(&["files/a.kml", "images/icon.png", "wells.KML"])),
            Some("wells.KML")
        );
        assert_eq!(pick_kml(&names(&["files/a.kml"])), Some("files/a.kml"));
        assert_eq!(pick_kml(&names(&["images/icon.png"])), None);
    }

    #[test]
    fn test_extract_kml() {
        let temp_dir = TempDir::new().unwrap();
        let kmz = temp_dir.path().join("RGWCD_Wells.kmz");
        write_kmz(
            &kmz,
            &[
                ("images/icon.png", "png"),
                ("doc.kml", "<kml><Document><name>Wells</name></Document></kml>"),
            ],
        );

        let kml = extract_kml(&kmz, temp_dir.path()).unwrap();

        assert_eq!(kml, temp_dir.path().join("RGWCD_Wells.kml"));
        assert!(fs::read_to_string(&kml).unwrap().contains("<name>Wells</name>"));
        assert!(is_kmz(&kmz));
        assert!(!is_kmz(&kml));
    }

    #[test]
    fn test_kmz_without_kml() {
        let temp_dir = TempDir::new().unwrap();
        let kmz = temp_dir.path().join("empty.kmz");
        write_kmz(&kmz, &[("readme.txt", "nothing here")]);

        let err = extract_kml(&kmz, temp_dir.path()).unwrap_err();
        assert!(matches!(err, Error::KmzWithoutKml { .. }));
    }
}
