use image::{GrayImage, Rgb, RgbImage, codecs::jpeg::JpegEncoder, imageops};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    Error, Result,
    config::PredictConfig,
    model::Encoder,
    postprocess::{Colormap, gray_to_rgb},
};

/// Width of the white column between source and visualization.
pub const SEPARATOR_WIDTH: u32 = 50;

/// Which artifacts are written for each datapoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputFormat {
    Gray,
    Color,
    All,
}

impl OutputFormat {
    pub fn artifacts(self) -> &'static [ArtifactKind] {
        match self {
            OutputFormat::Gray => &[ArtifactKind::Gray],
            OutputFormat::Color => &[ArtifactKind::Color],
            OutputFormat::All => &[ArtifactKind::Gray, ArtifactKind::Color],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Gray => "gray",
            OutputFormat::Color => "color",
            OutputFormat::All => "all",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "gray" | "grayscale" => Ok(OutputFormat::Gray),
            "1" | "color" => Ok(OutputFormat::Color),
            "2" | "all" => Ok(OutputFormat::All),
            other => Err(Error::config(format!(
                "unknown output format `{other}`, expected 0|gray|grayscale, 1|color, or 2|all"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for OutputFormat {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OutputFormat> for String {
    fn from(value: OutputFormat) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Gray,
    Color,
}

impl ArtifactKind {
    fn flat_dir(self) -> &'static str {
        match self {
            ArtifactKind::Gray => "gray",
            ArtifactKind::Color => "color",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Gray => "g",
            ArtifactKind::Color => "c",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputLayout {
    /// `save_dir/<data_name>/{gray,color}/<stem>.jpg`
    Flat,
    /// Mirrors the input tree: `save_dir/<gp>/<gp name>_dav2_<encoder>_{g,c}/<stem>.jpg`
    FullPath,
}

/// A composed image and where it goes.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub image: RgbImage,
}

/// Derives destinations and writes JPEG artifacts.
///
/// Paths are a pure function of the writer's settings and the source path;
/// nothing here looks at the filesystem until [`OutputWriter::write`].
#[derive(Clone, Debug)]
pub struct OutputWriter {
    save_dir: PathBuf,
    anchor: PathBuf,
    data_name: String,
    encoder: Encoder,
    layout: OutputLayout,
    format: OutputFormat,
    side_by_side: bool,
    jpeg_quality: u8,
    colormap: Colormap,
}

impl OutputWriter {
    /// `anchor` is the directory source paths are made relative to in
    /// full-path mode, so that relative paths start with `data_name`.
    pub fn new(config: &PredictConfig, data_name: impl Into<String>, anchor: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: config.save_dir.clone(),
            anchor: anchor.into(),
            data_name: data_name.into(),
            encoder: config.encoder,
            layout: if config.use_fullpath {
                OutputLayout::FullPath
            } else {
                OutputLayout::Flat
            },
            format: config.format,
            side_by_side: !config.pred_only,
            jpeg_quality: config.jpeg_quality,
            colormap: Colormap::spectral_r(),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn destination(&self, source: &Path, kind: ArtifactKind) -> Result<PathBuf> {
        let stem = source
            .file_stem()
            .ok_or_else(|| Error::Output(format!("`{}` has no file name", source.display())))?;
        let mut file_name = stem.to_os_string();
        file_name.push(".jpg");
        Ok(self.destination_dir(source, kind).join(file_name))
    }

    fn destination_dir(&self, source: &Path, kind: ArtifactKind) -> PathBuf {
        match self.layout {
            OutputLayout::Flat => self.save_dir.join(&self.data_name).join(kind.flat_dir()),
            OutputLayout::FullPath => {
                let relative = match source.strip_prefix(&self.anchor) {
                    Ok(relative) => relative.to_path_buf(),
                    Err(_) => Path::new(&self.data_name).join(source.file_name().unwrap_or_default()),
                };
                let grandparent = relative
                    .parent()
                    .and_then(Path::parent)
                    .filter(|gp| !gp.as_os_str().is_empty());
                let (base, name) = match grandparent {
                    Some(gp) => (
                        self.save_dir.join(gp),
                        gp.file_name()
                            .map(|name| name.to_string_lossy().into_owned())
                            .unwrap_or_else(|| self.data_name.clone()),
                    ),
                    None => (self.save_dir.clone(), self.data_name.clone()),
                };
                base.join(format!(
                    "{name}_dav2_{}_{}",
                    self.encoder.as_str(),
                    kind.suffix()
                ))
            }
        }
    }

    /// Builds every artifact selected by the output format.
    pub fn artifacts(&self, source: &Path, image: &RgbImage, depth: &GrayImage) -> Result<Vec<Artifact>> {
        self.format
            .artifacts()
            .iter()
            .map(|&kind| {
                let visual = match kind {
                    ArtifactKind::Gray => gray_to_rgb(depth),
                    ArtifactKind::Color => self.colormap.apply(depth),
                };
                let image = if self.side_by_side {
                    compose_side_by_side(image, &visual)?
                } else {
                    visual
                };
                Ok(Artifact {
                    kind,
                    path: self.destination(source, kind)?,
                    image,
                })
            })
            .collect()
    }

    /// Writes all artifacts for one datapoint, returning their paths.
    pub fn write(&self, source: &Path, image: &RgbImage, depth: &GrayImage) -> Result<Vec<PathBuf>> {
        let artifacts = self.artifacts(source, image, depth)?;
        let mut written = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if let Some(dir) = artifact.path.parent() {
                fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
            }
            save_jpeg(&artifact.path, &artifact.image, self.jpeg_quality)?;
            tracing::trace!(path = %artifact.path.display(), "wrote artifact");
            written.push(artifact.path);
        }
        Ok(written)
    }
}

/// `[source | white separator | visual]`, both inputs sharing one height.
pub fn compose_side_by_side(source: &RgbImage, visual: &RgbImage) -> Result<RgbImage> {
    if source.height() != visual.height() {
        return Err(Error::Output(format!(
            "source height {} does not match visualization height {}",
            source.height(),
            visual.height()
        )));
    }

    let width = source.width() + SEPARATOR_WIDTH + visual.width();
    let mut canvas = RgbImage::from_pixel(width, source.height(), Rgb([255, 255, 255]));
    imageops::replace(&mut canvas, source, 0, 0);
    imageops::replace(
        &mut canvas,
        visual,
        (source.width() + SEPARATOR_WIDTH) as i64,
        0,
    );
    Ok(canvas)
}

pub fn save_jpeg(path: &Path, image: &RgbImage, quality: u8) -> Result<()> {
    let file = File::create(path).map_err(|err| Error::io(path, err))?;
    let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality);
    image
        .write_with_encoder(encoder)
        .map_err(|source| Error::ImageSave {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writer(config: &PredictConfig, data_name: &str, anchor: &str) -> OutputWriter {
        OutputWriter::new(config, data_name, anchor)
    }

    #[test]
    fn format_parses_every_alias() {
        for (raw, expected) in [
            ("0", OutputFormat::Gray),
            ("gray", OutputFormat::Gray),
            ("GrayScale", OutputFormat::Gray),
            ("1", OutputFormat::Color),
            ("COLOR", OutputFormat::Color),
            ("2", OutputFormat::All),
            ("all", OutputFormat::All),
        ] {
            assert_eq!(raw.parse::<OutputFormat>().unwrap(), expected, "{raw}");
        }
        assert!(matches!("3".parse::<OutputFormat>(), Err(Error::Config(_))));
        assert!(matches!("depth".parse::<OutputFormat>(), Err(Error::Config(_))));
    }

    #[test]
    fn format_selects_artifact_count() {
        assert_eq!(OutputFormat::All.artifacts().len(), 2);
        assert_eq!(OutputFormat::Gray.artifacts(), &[ArtifactKind::Gray]);
        assert_eq!(OutputFormat::Color.artifacts(), &[ArtifactKind::Color]);
    }

    #[test]
    fn flat_layout_groups_by_data_name() {
        let mut config = PredictConfig::new("data/imgs", Encoder::Vits);
        config.save_dir = PathBuf::from("out");
        let writer = writer(&config, "imgs", "data");
        let gray = writer
            .destination(Path::new("data/imgs/a.png"), ArtifactKind::Gray)
            .unwrap();
        let color = writer
            .destination(Path::new("data/imgs/a.png"), ArtifactKind::Color)
            .unwrap();
        assert_eq!(gray, PathBuf::from("out/imgs/gray/a.jpg"));
        assert_eq!(color, PathBuf::from("out/imgs/color/a.jpg"));
    }

    #[test]
    fn full_path_layout_mirrors_scene_directories() {
        let mut config = PredictConfig::new("root", Encoder::Vits);
        config.save_dir = PathBuf::from("out");
        config.use_fullpath = true;
        let writer = writer(&config, "root", "");
        let path = writer
            .destination(Path::new("root/sceneA/imgs/a.jpg"), ArtifactKind::Color)
            .unwrap();
        assert_eq!(path, PathBuf::from("out/root/sceneA/sceneA_dav2_vits_c/a.jpg"));
        assert!(path.parent().unwrap().ends_with("sceneA_dav2_vits_c"));
    }

    #[test]
    fn full_path_layout_falls_back_to_data_name_for_shallow_paths() {
        let mut config = PredictConfig::new("data/imgs", Encoder::Vitl);
        config.save_dir = PathBuf::from("out");
        config.use_fullpath = true;
        let writer = writer(&config, "imgs", "data");
        let path = writer
            .destination(Path::new("data/imgs/a.jpg"), ArtifactKind::Gray)
            .unwrap();
        assert_eq!(path, PathBuf::from("out/imgs_dav2_vitl_g/a.jpg"));
    }

    #[test]
    fn destinations_are_deterministic() {
        let mut config = PredictConfig::new("root", Encoder::Vitb);
        config.use_fullpath = true;
        let a = writer(&config, "root", "");
        let b = writer(&config, "root", "");
        let source = Path::new("root/x/y/z/frame.png");
        assert_eq!(
            a.destination(source, ArtifactKind::Gray).unwrap(),
            b.destination(source, ArtifactKind::Gray).unwrap()
        );
    }

    #[test]
    fn side_by_side_inserts_white_separator() {
        let source = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let visual = RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]));
        let combined = compose_side_by_side(&source, &visual).unwrap();
        assert_eq!(combined.dimensions(), (2 * 4 + 50, 3));
        for y in 0..3 {
            assert_eq!(combined.get_pixel(3, y).0, [10, 20, 30]);
            for x in 4..54 {
                assert_eq!(combined.get_pixel(x, y).0, [255, 255, 255]);
            }
            assert_eq!(combined.get_pixel(54, y).0, [1, 2, 3]);
        }
    }

    #[test]
    fn side_by_side_rejects_height_mismatch() {
        let source = RgbImage::new(4, 3);
        let visual = RgbImage::new(4, 2);
        assert!(matches!(
            compose_side_by_side(&source, &visual),
            Err(Error::Output(_))
        ));
    }

    #[test]
    fn write_creates_directories_and_readable_jpegs() {
        let dir = tempdir().unwrap();
        let mut config = PredictConfig::new(dir.path().join("imgs"), Encoder::Vits);
        config.save_dir = dir.path().join("out");
        let writer = writer(&config, "imgs", dir.path().to_str().unwrap());

        let image = RgbImage::from_pixel(16, 8, Rgb([200, 100, 50]));
        let depth = GrayImage::from_fn(16, 8, |x, _| image::Luma([(x * 16) as u8]));
        let written = writer
            .write(&dir.path().join("imgs/a.jpg"), &image, &depth)
            .unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(written[0], dir.path().join("out/imgs/gray/a.jpg"));
        for path in &written {
            let decoded = image::open(path).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (2 * 16 + 50, 8));
        }
    }

    #[test]
    fn pred_only_writes_bare_visualization() {
        let dir = tempdir().unwrap();
        let mut config = PredictConfig::new(dir.path().join("imgs"), Encoder::Vits);
        config.save_dir = dir.path().join("out");
        config.pred_only = true;
        config.format = OutputFormat::Color;
        let writer = writer(&config, "imgs", dir.path().to_str().unwrap());

        let image = RgbImage::new(10, 6);
        let depth = GrayImage::new(10, 6);
        let written = writer
            .write(&dir.path().join("imgs/b.png"), &image, &depth)
            .unwrap();

        assert_eq!(written, vec![dir.path().join("out/imgs/color/b.jpg")]);
        let decoded = image::open(&written[0]).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 6));
    }
}
