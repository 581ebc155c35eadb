//! Sources of update artifacts.
//!
//! An artifact consists of three named streams: the image itself, `<image>.sha256`,
//! and `<image>.verity`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};
use twinboot_verity::metadata::parse_checksum_file;
use twinboot_verity::{HashDigest, VerityMetadata, VerityResult};

use crate::errors::{CtrlError, CtrlResult};

/// Image name used when neither the source nor the operator names one.
pub const DEFAULT_IMAGE_NAME: &str = "rootfs.img";

/// Prefix of staged image files.
const STAGED_PREFIX: &str = "image-";

/// Sidecar files are small, anything larger is not a sidecar.
const SIDECAR_LIMIT: u64 = 64 * 1024;

/// Opens named byte streams.
pub trait ArtifactSource {
    /// Human-readable location for logs.
    fn location(&self) -> String;

    fn open(&self, name: &str) -> io::Result<Box<dyn Read>>;
}

/// Artifacts in a local directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    base: PathBuf,
}

impl DirSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl ArtifactSource for DirSource {
    fn location(&self) -> String {
        self.base.display().to_string()
    }

    fn open(&self, name: &str) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(File::open(self.base.join(name))?))
    }
}

/// Artifacts below an HTTP(S) base URL.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

impl ArtifactSource for HttpSource {
    fn location(&self) -> String {
        self.base_url.clone()
    }

    fn open(&self, name: &str) -> io::Result<Box<dyn Read>> {
        let url = format!("{}/{name}", self.base_url);
        debug!("requesting {url}");
        let response = ureq::get(&url).call().map_err(io::Error::other)?;
        Ok(Box::new(response.into_body().into_reader()))
    }
}

/// Select a source for the operator-provided location.
///
/// Returns the source and the image name. The location may name the image itself,
/// e.g., `https://example.com/releases/rootfs.img` or `/media/usb/rootfs.img`, in which
/// case the last path component is the image name unless `image` overrides it.
pub fn resolve_source(location: &str, image: Option<&str>) -> (Box<dyn ArtifactSource>, String) {
    if let Some((scheme, rest)) = location
        .split_once("://")
        .filter(|(scheme, _)| matches!(*scheme, "http" | "https"))
    {
        let (base, name) = match (image, rest.trim_end_matches('/').rsplit_once('/')) {
            (Some(image), _) => (location.to_owned(), image.to_owned()),
            (None, Some((base, name))) if name.contains('.') => {
                (format!("{scheme}://{base}"), name.to_owned())
            }
            (None, _) => (location.to_owned(), DEFAULT_IMAGE_NAME.to_owned()),
        };
        return (Box::new(HttpSource::new(&base)), name);
    }
    let path = Path::new(location);
    let (base, name) = match image {
        Some(image) => (path, image.to_owned()),
        None if path.is_file() => (
            path.parent().unwrap_or(Path::new(".")),
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| DEFAULT_IMAGE_NAME.to_owned()),
        ),
        None => (path, DEFAULT_IMAGE_NAME.to_owned()),
    };
    (Box::new(DirSource::new(base)), name)
}

/// Update artifact staged on local storage for the duration of one attempt.
///
/// The staged image is removed when the artifact is dropped.
#[derive(Debug)]
pub struct UpdateArtifact {
    pub name: String,
    image: NamedTempFile,
    image_size: u64,
    checksum_file: String,
    verity_file: String,
}

impl UpdateArtifact {
    /// Size of the staged image in bytes.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Open the staged image for a verification pass.
    pub fn open_image(&self) -> io::Result<File> {
        let mut file = self.image.reopen()?;
        file.rewind()?;
        Ok(file)
    }

    /// Checksum as shipped, before parsing.
    pub fn expected_sha256_raw(&self) -> &str {
        self.checksum_file
            .split_whitespace()
            .next()
            .unwrap_or_default()
    }

    pub fn expected_sha256(&self) -> VerityResult<HashDigest> {
        parse_checksum_file(&self.checksum_file)
    }

    pub fn verity_metadata(&self) -> VerityResult<VerityMetadata> {
        VerityMetadata::parse(&self.verity_file)
    }
}

/// Download the artifact and stage the image in `staging_dir`.
pub fn fetch_artifact(
    source: &dyn ArtifactSource,
    name: &str,
    staging_dir: &Path,
) -> CtrlResult<UpdateArtifact> {
    let download_error =
        |name: String| move |source: io::Error| CtrlError::Download { name, source };
    info!("fetching {name:?} from {}", source.location());
    let checksum_name = format!("{name}.sha256");
    let checksum_file =
        read_sidecar(source, &checksum_name).map_err(download_error(checksum_name))?;
    let verity_name = format!("{name}.verity");
    let verity_file =
        read_sidecar(source, &verity_name).map_err(download_error(verity_name))?;
    let (image, image_size) =
        stage_image(source, name, staging_dir).map_err(download_error(name.to_owned()))?;
    info!("staged image of {image_size} bytes");
    Ok(UpdateArtifact {
        name: name.to_owned(),
        image,
        image_size,
        checksum_file,
        verity_file,
    })
}

fn read_sidecar(source: &dyn ArtifactSource, name: &str) -> io::Result<String> {
    let mut contents = String::new();
    source
        .open(name)?
        .take(SIDECAR_LIMIT)
        .read_to_string(&mut contents)?;
    Ok(contents)
}

fn stage_image(
    source: &dyn ArtifactSource,
    name: &str,
    staging_dir: &Path,
) -> io::Result<(NamedTempFile, u64)> {
    fs::create_dir_all(staging_dir)?;
    let staged = tempfile::Builder::new()
        .prefix(STAGED_PREFIX)
        .tempfile_in(staging_dir)?;
    let mut reader = source.open(name)?;
    let mut writer = BufWriter::new(staged.as_file());
    let size = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    drop(writer);
    Ok((staged, size))
}

/// Remove images left behind by attempts that never finished.
///
/// Returns the number of removed files. Must only be called while holding the session
/// lock, otherwise the image of a running attempt may be removed.
pub fn clean_staging(staging_dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(staging_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(STAGED_PREFIX) {
            continue;
        }
        debug!("removing leftover staged image {:?}", entry.path());
        fs::remove_file(entry.path())?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_artifact(dir: &Path) {
        fs::write(dir.join("rootfs.img"), b"Hello, World!").unwrap();
        fs::write(
            dir.join("rootfs.img.sha256"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f  rootfs.img\n",
        )
        .unwrap();
        fs::write(dir.join("rootfs.img.verity"), "00".repeat(32)).unwrap();
    }

    #[test]
    fn test_fetch_from_directory() {
        let source_dir = tempfile::tempdir().unwrap();
        let staging_dir = tempfile::tempdir().unwrap();
        write_artifact(source_dir.path());
        let (source, name) = resolve_source(&source_dir.path().to_string_lossy(), None);
        assert_eq!(name, DEFAULT_IMAGE_NAME);
        let artifact = fetch_artifact(source.as_ref(), &name, staging_dir.path()).unwrap();
        assert_eq!(artifact.image_size(), 13);
        let mut contents = Vec::new();
        artifact
            .open_image()
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"Hello, World!");
        assert_eq!(
            artifact.expected_sha256().unwrap().to_hex(),
            artifact.expected_sha256_raw()
        );
        assert_eq!(artifact.verity_metadata().unwrap().root_hash.raw(), &[0; 32]);
        drop(artifact);
        assert_eq!(fs::read_dir(staging_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clean_staging() {
        let staging_dir = tempfile::tempdir().unwrap();
        assert_eq!(clean_staging(&staging_dir.path().join("missing")).unwrap(), 0);
        fs::write(staging_dir.path().join("image-crashed"), vec![0; 4096]).unwrap();
        fs::write(staging_dir.path().join("notes.txt"), "keep").unwrap();
        assert_eq!(clean_staging(staging_dir.path()).unwrap(), 1);
        let remaining = fs::read_dir(staging_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(remaining, ["notes.txt"]);
    }

    #[test]
    fn test_missing_sidecar_is_download_error() {
        let source_dir = tempfile::tempdir().unwrap();
        let staging_dir = tempfile::tempdir().unwrap();
        write_artifact(source_dir.path());
        fs::remove_file(source_dir.path().join("rootfs.img.verity")).unwrap();
        let source = DirSource::new(source_dir.path());
        let Err(CtrlError::Download { name, .. }) =
            fetch_artifact(&source, "rootfs.img", staging_dir.path())
        else {
            panic!("expected download error");
        };
        assert_eq!(name, "rootfs.img.verity");
    }

    #[test]
    fn test_resolve_image_path() {
        let source_dir = tempfile::tempdir().unwrap();
        write_artifact(source_dir.path());
        let image = source_dir.path().join("rootfs.img");
        let (source, name) = resolve_source(&image.to_string_lossy(), None);
        assert_eq!(name, "rootfs.img");
        assert_eq!(source.location(), source_dir.path().display().to_string());
        let (_, name) = resolve_source(&image.to_string_lossy(), Some("other.img"));
        assert_eq!(name, "other.img");
    }

    #[test]
    fn test_resolve_http() {
        let (source, name) = resolve_source("https://example.com/releases/os.img", None);
        assert_eq!(source.location(), "https://example.com/releases");
        assert_eq!(name, "os.img");
        let (source, name) = resolve_source("http://example.com/releases/", None);
        assert_eq!(source.location(), "http://example.com/releases");
        assert_eq!(name, DEFAULT_IMAGE_NAME);
        let (source, name) = resolve_source("https://example.com/latest", Some("a.img"));
        assert_eq!(source.location(), "https://example.com/latest");
        assert_eq!(name, "a.img");
    }
}
