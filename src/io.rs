use image::RgbImage;
use std::{
    ffi::OsStr,
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
};
use walkdir::WalkDir;

use crate::{Error, Result};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm"];

/// One decoded input plus where it came from.
#[derive(Clone, Debug)]
pub struct Datapoint {
    pub image: RgbImage,
    /// Source path; for video frames a virtual `<parent>/<stem>/<index>.jpg`.
    pub path: PathBuf,
    pub index: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frames: Option<usize>,
}

#[derive(Clone, Debug)]
enum SourceKind {
    Images(Vec<PathBuf>),
    Video(PathBuf, VideoInfo),
}

/// Enumerates an image file, an image directory, or a video.
#[derive(Clone, Debug)]
pub struct DataSource {
    data_name: String,
    anchor: PathBuf,
    kind: SourceKind,
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

pub fn is_image_path(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_video_path(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

fn name_of(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

impl DataSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::config(format!(
                "input `{}` does not exist",
                path.display()
            )));
        }

        if path.is_dir() {
            return Self::open_dir(path);
        }

        let parent = path.parent().unwrap_or(Path::new(""));
        if is_image_path(path) {
            let data_name = name_of(parent)
                .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_default();
            Ok(Self {
                data_name,
                anchor: parent.parent().unwrap_or(Path::new("")).to_path_buf(),
                kind: SourceKind::Images(vec![path.to_path_buf()]),
            })
        } else if is_video_path(path) {
            let info = probe_video(path)?;
            Ok(Self {
                data_name: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                anchor: parent.to_path_buf(),
                kind: SourceKind::Video(path.to_path_buf(), info),
            })
        } else {
            Err(Error::config(format!(
                "unsupported input `{}`, expected an image, a video, or a directory",
                path.display()
            )))
        }
    }

    fn open_dir(root: &Path) -> Result<Self> {
        let mut images = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|err| {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                Error::io(path, err.into())
            })?;
            if entry.file_type().is_file() && is_image_path(entry.path()) {
                images.push(entry.into_path());
            }
        }
        images.sort();

        Ok(Self {
            data_name: name_of(root).unwrap_or_else(|| "data".to_string()),
            anchor: root.parent().unwrap_or(Path::new("")).to_path_buf(),
            kind: SourceKind::Images(images),
        })
    }

    pub fn data_name(&self) -> &str {
        &self.data_name
    }

    /// Directory source paths are made relative to, so that relative paths
    /// start with the data name.
    pub fn anchor(&self) -> &Path {
        &self.anchor
    }

    /// Total datapoints, `None` when a video does not report its frame count.
    pub fn len(&self) -> Option<usize> {
        match &self.kind {
            SourceKind::Images(paths) => Some(paths.len()),
            SourceKind::Video(_, info) => info.frames,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn datapoints(&self) -> Result<Datapoints> {
        let inner = match &self.kind {
            SourceKind::Images(paths) => DatapointsInner::Images {
                paths: paths.clone().into_iter().enumerate(),
            },
            SourceKind::Video(path, info) => DatapointsInner::Video(VideoFrames::spawn(path, *info)?),
        };
        Ok(Datapoints { inner })
    }
}

/// Iterator over decoded datapoints, in enumeration order.
pub struct Datapoints {
    inner: DatapointsInner,
}

enum DatapointsInner {
    Images {
        paths: std::iter::Enumerate<std::vec::IntoIter<PathBuf>>,
    },
    Video(VideoFrames),
}

impl Iterator for Datapoints {
    type Item = Result<Datapoint>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            DatapointsInner::Images { paths } => {
                let (index, path) = paths.next()?;
                Some(load_image(&path).map(|image| Datapoint { image, path, index }))
            }
            DatapointsInner::Video(frames) => frames.next(),
        }
    }
}

pub fn load_image(path: &Path) -> Result<RgbImage> {
    image::open(path)
        .map(|image| image.to_rgb8())
        .map_err(|err| Error::decode(path, err))
}

/// Reads `width,height,nb_frames` of the first video stream through `ffprobe`.
pub fn probe_video(path: &Path) -> Result<VideoInfo> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,nb_frames",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .map_err(|err| Error::decode(path, format!("failed to run ffprobe: {err}")))?;

    if !output.status.success() {
        return Err(Error::decode(
            path,
            format!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| Error::decode(path, "ffprobe reported no video stream"))
}

fn parse_probe_output(stdout: &str) -> Option<VideoInfo> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    let mut fields = line.split(',').map(str::trim);
    let width = fields.next()?.parse().ok()?;
    let height = fields.next()?.parse().ok()?;
    let frames = fields.next().and_then(|value| value.parse().ok());
    (width > 0 && height > 0).then_some(VideoInfo {
        width,
        height,
        frames,
    })
}

/// Raw `rgb24` frames streamed from an `ffmpeg` child process.
pub struct VideoFrames {
    source: PathBuf,
    frame_dir: PathBuf,
    info: VideoInfo,
    child: Child,
    stdout: ChildStdout,
    index: usize,
    done: bool,
}

impl VideoFrames {
    fn spawn(path: &Path, info: VideoInfo) -> Result<Self> {
        Self::spawn_with(OsStr::new("ffmpeg"), path, info)
    }

    fn spawn_with(program: &OsStr, path: &Path, info: VideoInfo) -> Result<Self> {
        // Frames keep the coded size ffprobe reported; rotation metadata is ignored.
        let scale_arg = format!("scale={}:{}", info.width, info.height);
        let mut child = Command::new(program)
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(path)
            .args(["-vf", scale_arg.as_str()])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| Error::decode(path, format!("failed to run ffmpeg: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::decode(path, "ffmpeg stdout unavailable"))?;

        let stem = path.file_stem().unwrap_or_default();
        let frame_dir = path.parent().unwrap_or(Path::new("")).join(stem);
        Ok(Self {
            source: path.to_path_buf(),
            frame_dir,
            info,
            child,
            stdout,
            index: 0,
            done: false,
        })
    }

    pub fn frame_path(&self, index: usize) -> PathBuf {
        self.frame_dir.join(format!("{index:06}.jpg"))
    }

    /// `Ok(None)` only when the stream ends on a frame boundary and ffmpeg
    /// exits cleanly.
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let frame_len = self.info.width as usize * self.info.height as usize * 3;
        let mut buffer = vec![0u8; frame_len];
        let mut filled = 0;
        while filled < frame_len {
            match self.stdout.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::decode(&self.source, err)),
            }
        }

        if filled == 0 {
            self.wait_for_exit()?;
            return Ok(None);
        }
        if filled < frame_len {
            return Err(Error::decode(
                &self.source,
                format!(
                    "frame {} truncated at {filled} of {frame_len} bytes",
                    self.index
                ),
            ));
        }
        RgbImage::from_raw(self.info.width, self.info.height, buffer)
            .map(Some)
            .ok_or_else(|| Error::decode(&self.source, "frame buffer size mismatch"))
    }

    fn wait_for_exit(&mut self) -> Result<()> {
        self.done = true;
        let status = self
            .child
            .wait()
            .map_err(|err| Error::decode(&self.source, err))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::decode(
                &self.source,
                format!("ffmpeg exited with {status} after {} frames", self.index),
            ))
        }
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl Iterator for VideoFrames {
    type Item = Result<Datapoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(image)) => {
                let index = self.index;
                self.index += 1;
                Some(Ok(Datapoint {
                    image,
                    path: self.frame_path(index),
                    index,
                }))
            }
            Ok(None) => None,
            Err(err) => {
                self.finish();
                Some(Err(err))
            }
        }
    }
}

impl Drop for VideoFrames {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_png(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, image::Rgb([1, 2, 3]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn directory_source_is_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("imgs");
        fs::create_dir_all(root.join("nested")).unwrap();
        write_png(&root.join("b.png"), 4, 4);
        write_png(&root.join("a.png"), 4, 4);
        write_png(&root.join("nested/c.png"), 4, 4);
        fs::write(root.join("notes.txt"), "skip").unwrap();

        let source = DataSource::open(&root).unwrap();
        assert_eq!(source.data_name(), "imgs");
        assert_eq!(source.anchor(), dir.path());
        assert_eq!(source.len(), Some(3));

        let paths: Vec<_> = source
            .datapoints()
            .unwrap()
            .map(|dp| dp.unwrap().path)
            .collect();
        assert_eq!(
            paths,
            vec![root.join("a.png"), root.join("b.png"), root.join("nested/c.png")]
        );
    }

    #[test]
    fn single_image_uses_parent_as_data_name() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("scene");
        fs::create_dir_all(&root).unwrap();
        let file = root.join("x.png");
        write_png(&file, 5, 3);

        let source = DataSource::open(&file).unwrap();
        assert_eq!(source.data_name(), "scene");
        assert_eq!(source.anchor(), dir.path());

        let points: Vec<_> = source.datapoints().unwrap().collect();
        assert_eq!(points.len(), 1);
        let point = points.into_iter().next().unwrap().unwrap();
        assert_eq!(point.image.dimensions(), (5, 3));
        assert_eq!(point.index, 0);
    }

    #[test]
    fn missing_or_unsupported_inputs_are_config_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            DataSource::open(dir.path().join("missing.png")),
            Err(Error::Config(_))
        ));
        let text = dir.path().join("a.txt");
        fs::write(&text, "x").unwrap();
        assert!(matches!(DataSource::open(&text), Err(Error::Config(_))));
    }

    #[test]
    fn corrupt_image_is_a_decode_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("broken.jpg");
        fs::write(&file, b"not a jpeg").unwrap();
        let source = DataSource::open(&file).unwrap();
        let first = source.datapoints().unwrap().next().unwrap();
        assert!(matches!(first, Err(Error::Decode { .. })));
    }

    #[test]
    fn probe_output_parsing() {
        assert_eq!(
            parse_probe_output("1920,1080,300\n"),
            Some(VideoInfo {
                width: 1920,
                height: 1080,
                frames: Some(300)
            })
        );
        assert_eq!(
            parse_probe_output("640,480,N/A\n").and_then(|info| info.frames),
            None
        );
        assert_eq!(parse_probe_output(""), None);
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.join("ffmpeg");
        fs::write(&program, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        program
    }

    #[cfg(unix)]
    fn decode_with(script: &str) -> Vec<Result<Datapoint>> {
        let dir = tempdir().unwrap();
        let program = fake_ffmpeg(dir.path(), script);
        let info = VideoInfo {
            width: 2,
            height: 2,
            frames: None,
        };
        VideoFrames::spawn_with(program.as_os_str(), &dir.path().join("clip.mp4"), info)
            .unwrap()
            .collect()
    }

    // One 2x2 rgb24 frame is 12 bytes.
    #[cfg(unix)]
    const ONE_FRAME: &str = r"printf '\001\002\003\004\005\006\007\010\011\012\013\014'";

    #[cfg(unix)]
    #[test]
    fn video_frames_end_cleanly_on_successful_exit() {
        let frames = decode_with(&format!("{ONE_FRAME}\nexit 0"));
        assert_eq!(frames.len(), 1);
        let frame = frames.into_iter().next().unwrap().unwrap();
        assert_eq!(frame.image.dimensions(), (2, 2));
        assert_eq!(frame.image.get_pixel(1, 1).0, [10, 11, 12]);
        assert!(frame.path.ends_with("clip/000000.jpg"));
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_failure_after_frames_is_a_decode_error() {
        let frames = decode_with(&format!("{ONE_FRAME}\necho 'decode error' >&2\nexit 1"));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(matches!(frames[1], Err(Error::Decode { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn truncated_frame_is_a_decode_error() {
        let frames = decode_with(&format!("{ONE_FRAME}\nprintf 'abcdef'\nexit 0"));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(matches!(frames[1], Err(Error::Decode { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_output_is_pinned_to_probed_size() {
        let dir = tempdir().unwrap();
        let program = fake_ffmpeg(dir.path(), r#"echo "$@" > "$(dirname "$0")/args""#);
        let info = VideoInfo {
            width: 1080,
            height: 1920,
            frames: None,
        };
        let frames: Vec<_> =
            VideoFrames::spawn_with(program.as_os_str(), &dir.path().join("phone.mov"), info)
                .unwrap()
                .collect();
        assert!(frames.is_empty());

        let args = fs::read_to_string(dir.path().join("args")).unwrap();
        let noautorotate = args.find("-noautorotate").unwrap();
        let input = args.find("-i ").unwrap();
        assert!(noautorotate < input);
        assert!(args.contains("-vf scale=1080:1920"));
        assert!(args.contains("-pix_fmt rgb24"));
    }

    #[test]
    fn extension_checks_are_case_insensitive() {
        assert!(is_image_path(Path::new("a/B.JPG")));
        assert!(is_video_path(Path::new("clip.MkV")));
        assert!(!is_image_path(Path::new("clip.mp4")));
    }
}
