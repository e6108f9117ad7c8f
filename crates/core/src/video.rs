//! Video frame sampling: ffprobe/ffmpeg frame source, every-Nth-frame
//! selection, and a caller-owned cursor over sampled and translated frames.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::resize_square;
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::translate::translate;

/// Default every-Nth-frame sampling stride.
pub const DEFAULT_SAMPLE_STRIDE: usize = 4;

/// When sampled frames go through the generator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoTranslationMode {
    /// Translate a frame the first time the cursor asks for it.
    #[default]
    Lazy,
    /// Translate every sampled frame before returning the sequence.
    Eager,
}

// ---------------------------------------------------------------------------
// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
pub struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    disposition: std::collections::HashMap<String, serde_json::Value>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => s.parse().ok(),
    }
}

fn is_attached_picture(stream: &FfprobeStream) -> bool {
    stream
        .disposition
        .get("attached_pic")
        .and_then(|v| v.as_i64())
        .is_some_and(|v| v != 0)
}

pub fn run_ffprobe(path: &Path) -> anyhow::Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> anyhow::Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON")
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec_name: String,
    /// Container-reported frame count, when present.
    pub frame_count: Option<u64>,
}

impl FfprobeOutput {
    /// First real video stream (cover art is skipped).
    pub fn video_stream(&self) -> anyhow::Result<VideoStreamInfo> {
        let stream = self
            .streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some("video"))
            .find(|s| !is_attached_picture(s))
            .ok_or_else(|| anyhow!("no video stream found"))?;

        let width = stream
            .width
            .ok_or_else(|| anyhow!("video stream missing width"))?;
        let height = stream
            .height
            .ok_or_else(|| anyhow!("video stream missing height"))?;
        if width == 0 || height == 0 {
            bail!("video stream has zero extent ({width}x{height})");
        }

        let fps_str = stream
            .r_frame_rate
            .as_deref()
            .or(stream.avg_frame_rate.as_deref())
            .unwrap_or("0/0");
        let fps = match parse_frame_rate(fps_str) {
            Some(fps) if fps > 0.0 => fps,
            _ => {
                warn!("could not determine frame rate (got {fps_str}), defaulting to 30");
                30.0
            }
        };

        Ok(VideoStreamInfo {
            stream_index: stream.index,
            width,
            height,
            fps,
            codec_name: stream
                .codec_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            frame_count: stream.nb_frames.as_deref().and_then(|n| n.parse().ok()),
        })
    }
}

fn build_decoder_args(path: &Path, stream_index: usize) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Decodes video to `rgb24` frames via an FFmpeg subprocess, yielding one
/// [`RgbImage`] at a time. Drains stderr in a background thread to prevent
/// pipe deadlock. Kills FFmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    width: u32,
    height: u32,
    frame_size: usize,
    stderr_thread: Option<thread::JoinHandle<()>>,
    done: bool,
}

impl VideoDecoder {
    pub fn new(path: &Path, info: &VideoStreamInfo) -> anyhow::Result<Self> {
        let frame_size = info.width as usize * info.height as usize * 3;
        let args = build_decoder_args(path, info.stream_index);

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr not piped"))?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            width: info.width,
            height: info.height,
            frame_size,
            stderr_thread: Some(stderr_thread),
            done: false,
        })
    }

    fn read_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut buf = vec![0u8; self.frame_size];
        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut buf[total_read..]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from ffmpeg stdout"),
            }
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    pub fn finish(&mut self) -> anyhow::Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg exited with status {}", status);
        }
        Ok(())
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::video(e)))
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Keep every `stride`-th frame, counting from 1, resized to `resolution`.
///
/// Frame `k` (1-based) is kept iff `k % stride == 0`, so a 20-frame clip at
/// stride 4 yields 0-based positions 3, 7, 11, 15 and 19.
pub fn sample_frames<I>(frames: I, stride: usize, resolution: u32) -> Result<Vec<RgbImage>>
where
    I: IntoIterator<Item = Result<RgbImage>>,
{
    if stride == 0 {
        return Err(Error::Video("sample stride must be at least 1".to_string()));
    }

    let mut sampled = Vec::new();
    for (index, frame) in frames.into_iter().enumerate() {
        let frame = frame?;
        if (index + 1) % stride == 0 {
            sampled.push(resize_square(&frame, resolution));
        }
    }
    Ok(sampled)
}

/// Probe, decode, and sample a video file.
pub fn sample_video(path: &Path, stride: usize, resolution: u32) -> Result<Vec<RgbImage>> {
    let info = run_ffprobe(path)
        .and_then(|probe| probe.video_stream())
        .with_context(|| format!("failed to probe {}", path.display()))
        .map_err(|e| Error::Decode(format!("{e:#}")))?;
    info!(
        path = %path.display(),
        width = info.width,
        height = info.height,
        fps = info.fps,
        codec = %info.codec_name,
        "probed video"
    );

    let mut decoder = VideoDecoder::new(path, &info).map_err(Error::video)?;
    let sampled = sample_frames(decoder.by_ref(), stride, resolution)?;
    decoder.finish().map_err(Error::video)?;

    debug!(frames = sampled.len(), stride, "sampled video frames");
    Ok(sampled)
}

/// Caller-owned cursor over sampled frames and their (cached) translations.
pub struct FrameSequence {
    frames: Vec<RgbImage>,
    translated: Vec<Option<RgbImage>>,
    position: usize,
}

impl FrameSequence {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        let translated = vec![None; frames.len()];
        Self {
            frames,
            translated,
            position: 0,
        }
    }

    /// Build a sequence and, in eager mode, translate every frame up front.
    pub fn prepare(
        frames: Vec<RgbImage>,
        mode: VideoTranslationMode,
        generator: &dyn Generator,
        resolution: u32,
    ) -> Result<Self> {
        let mut sequence = Self::new(frames);
        if mode == VideoTranslationMode::Eager {
            sequence.translate_all(generator, resolution)?;
        }
        Ok(sequence)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn current(&self) -> Option<&RgbImage> {
        self.frames.get(self.position)
    }

    /// Cached translation of the current frame, if it has been produced.
    pub fn current_translated(&self) -> Option<&RgbImage> {
        self.translated.get(self.position).and_then(Option::as_ref)
    }

    pub fn has_next(&self) -> bool {
        self.position + 1 < self.frames.len()
    }

    /// Move to the next frame. Past the last frame this fails with
    /// [`Error::OutOfRange`] and the cursor stays put.
    pub fn advance(&mut self) -> Result<usize> {
        let next = self.position + 1;
        if next >= self.frames.len() {
            return Err(Error::OutOfRange {
                index: next,
                len: self.frames.len(),
            });
        }
        self.position = next;
        Ok(next)
    }

    pub fn seek(&mut self, index: usize) -> Result<()> {
        if index >= self.frames.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.frames.len(),
            });
        }
        self.position = index;
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Translate the current frame on first request, then serve it from cache.
    pub fn translate_current(&mut self, generator: &dyn Generator, resolution: u32) -> Result<&RgbImage> {
        let index = self.position;
        let len = self.frames.len();
        let frame = self
            .frames
            .get(index)
            .ok_or(Error::OutOfRange { index, len })?;

        let slot = &mut self.translated[index];
        let translated = match slot.take() {
            Some(done) => done,
            None => translate(frame, generator, resolution)?,
        };
        Ok(slot.insert(translated))
    }

    pub fn translate_all(&mut self, generator: &dyn Generator, resolution: u32) -> Result<()> {
        for (frame, slot) in self.frames.iter().zip(self.translated.iter_mut()) {
            if slot.is_none() {
                *slot = Some(translate(frame, generator, resolution)?);
            }
        }
        Ok(())
    }

    pub fn translated_count(&self) -> usize {
        self.translated.iter().filter(|t| t.is_some()).count()
    }
}
