//! Directory-per-session file storage

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use ndarray::Array3;

use super::{
    LoadedSession, SessionManifest, SessionPersistence, StreamManifest, VolumeHeader,
    FORMAT_VERSION, MANIFEST_FILE, TRACKING_FILE,
};
use crate::config::{AssemblySettings, PersistenceSettings};
use crate::error::{Result, ResultExt, UsReconError};
use crate::reconstruction::{ReconstructInputData, ReconstructionInputAssembler, Volume};
use crate::session::position_recorder::PoseTrack;
use crate::session::{AcquisitionSession, RecordingWindow};
use crate::types::{ImageFrame, Timestamped, ToolPose, Transform3D};

/// Stores sessions as plain files below a root directory
#[derive(Debug, Clone)]
pub struct FilePersistence {
    root: PathBuf,
    assembler: ReconstructionInputAssembler,
}

impl FilePersistence {
    /// Store sessions below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            assembler: ReconstructionInputAssembler::default(),
        }
    }

    /// Build from configuration
    pub fn from_settings(settings: &PersistenceSettings, assembly: AssemblySettings) -> Result<Self> {
        Ok(Self::new(settings.resolve_root()?).with_assembly(assembly))
    }

    /// Use these settings when assembling loaded sessions
    pub fn with_assembly(mut self, settings: AssemblySettings) -> Self {
        self.assembler = ReconstructionInputAssembler::new(settings);
        self
    }

    /// Session root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a session directory without assembling it
    pub fn load(&self, dir: &Path) -> Result<LoadedSession> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let manifest: SessionManifest = serde_json::from_str(&text)
            .map_err(|e| UsReconError::from(e).with_context(manifest_path.display().to_string()))?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(UsReconError::Persistence(format!(
                "{}: unsupported format version {}",
                manifest_path.display(),
                manifest.format_version
            )));
        }

        let tool_id = manifest
            .probe_tool
            .as_ref()
            .map(|t| t.id.clone())
            .or_else(|| manifest.metadata.probe_tool_id.clone());
        let poses = read_tracking(&dir.join(&manifest.tracking_file))?;
        let track = PoseTrack::from_samples(
            tool_id.clone(),
            poses
                .into_iter()
                .filter(|p| tool_id.as_ref().map_or(true, |id| &p.value.tool_id == id))
                .map(|p| Timestamped::new(p.timestamp, p.value.transform))
                .collect(),
        );

        let mut streams = Vec::with_capacity(manifest.streams.len());
        for stream in &manifest.streams {
            let frames = read_stream(dir, stream)?;
            streams.push((stream.stream_id.clone(), frames));
        }

        tracing::info!(
            "Loaded session {} from {}: {} stream(s), {} poses",
            manifest.metadata.name,
            dir.display(),
            streams.len(),
            track.len()
        );
        Ok(LoadedSession {
            manifest,
            streams,
            track,
        })
    }
}

impl SessionPersistence for FilePersistence {
    fn write_session(&self, session: &AcquisitionSession) -> Result<PathBuf> {
        let state = session.state();
        if !state.has_recording() {
            return Err(UsReconError::InvalidTransition {
                operation: "save session",
                state,
            });
        }
        let (start, stop) = session
            .time_range()
            .ok_or_else(|| UsReconError::Persistence("session has no recording interval".to_string()))?;

        let dir = self.root.join(session.id());
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut streams = Vec::new();
        for recorder in session.streams() {
            let window = recorder.get_recording(start, stop);
            streams.push(write_stream(&dir, recorder.stream_id(), &window)?);
        }

        // Poses outside the interval are kept; edge frames need them as brackets
        let poses = session
            .positions()
            .map(|p| p.get_recording(f64::NEG_INFINITY, f64::INFINITY))
            .unwrap_or_default();
        write_tracking(&dir.join(TRACKING_FILE), &poses)?;

        let manifest = SessionManifest {
            format_version: FORMAT_VERSION,
            metadata: session.metadata(),
            probe_tool: session.probe_tool(),
            tracking_file: TRACKING_FILE.to_string(),
            streams,
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        tracing::info!(
            "Saved session {} to {} ({} stream(s), {} poses)",
            session.id(),
            dir.display(),
            manifest.streams.len(),
            poses.len()
        );
        Ok(dir)
    }

    fn read_session(&self, path: &Path) -> Result<Vec<ReconstructInputData>> {
        let loaded = self.load(path)?;
        let probe_tool = loaded.manifest.probe_tool.as_ref();

        loaded
            .streams
            .into_iter()
            .map(|(stream_id, frames)| {
                self.assembler
                    .assemble_frames(&stream_id, frames, &loaded.track, probe_tool)
                    .with_context(|| format!("assembling stream {}", stream_id))
            })
            .collect()
    }

    fn write_volume(&self, volume: &Volume, dir: &Path, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let data_file = format!("{}.volume.raw", name);
        let header_path = dir.join(format!("{}.volume.json", name));
        let (x, y, z) = volume.dimensions();

        let data_path = dir.join(&data_file);
        let file = File::create(&data_path).with_context(|| format!("creating {}", data_path.display()))?;
        let mut writer = BufWriter::new(file);
        for value in volume.data.iter() {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;

        let header = VolumeHeader {
            dimensions: [x, y, z],
            spacing: volume.spacing,
            origin: volume.origin,
            orientation: volume.orientation.to_row_vec(),
            element_type: "f32".to_string(),
            byte_order: "little".to_string(),
            data_file,
        };
        fs::write(&header_path, serde_json::to_string_pretty(&header)?)
            .with_context(|| format!("writing {}", header_path.display()))?;

        tracing::info!("Saved {}x{}x{} volume to {}", x, y, z, header_path.display());
        Ok(header_path)
    }

    fn read_volume(&self, header_path: &Path) -> Result<Volume> {
        let text = fs::read_to_string(header_path)
            .with_context(|| format!("reading {}", header_path.display()))?;
        let header: VolumeHeader = serde_json::from_str(&text)?;
        if header.element_type != "f32" || header.byte_order != "little" {
            return Err(UsReconError::Persistence(format!(
                "{}: unsupported voxel format {} ({})",
                header_path.display(),
                header.element_type,
                header.byte_order
            )));
        }

        let data_path = header_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&header.data_file);
        let mut bytes = Vec::new();
        File::open(&data_path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .with_context(|| format!("reading {}", data_path.display()))?;

        let [x, y, z] = header.dimensions;
        let expected = x
            .checked_mul(y)
            .and_then(|n| n.checked_mul(z))
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| {
                UsReconError::Persistence(format!(
                    "{}: dimensions {:?} overflow",
                    header_path.display(),
                    header.dimensions
                ))
            })?;
        if bytes.len() != expected {
            return Err(UsReconError::Persistence(format!(
                "{}: expected {} bytes, found {}",
                data_path.display(),
                expected,
                bytes.len()
            )));
        }

        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let data = Array3::from_shape_vec((z, y, x), values)
            .map_err(|e| UsReconError::Persistence(format!("{}: {}", data_path.display(), e)))?;

        Ok(Volume {
            data,
            spacing: header.spacing,
            origin: header.origin,
            orientation: Transform3D::from_row_slice(&header.orientation)?,
        })
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.chars().any(char::is_whitespace) {
        return Err(UsReconError::Persistence(format!("invalid file name '{}'", name)));
    }
    Ok(())
}

fn write_stream(
    dir: &Path,
    stream_id: &str,
    window: &RecordingWindow<Arc<ImageFrame>>,
) -> Result<StreamManifest> {
    check_name(stream_id)?;
    let timestamps_file = format!("{}.fts", stream_id);
    let frames_file = format!("{}.frames.bin", stream_id);

    let fts_path = dir.join(&timestamps_file);
    let bin_path = dir.join(&frames_file);
    let mut fts = BufWriter::new(
        File::create(&fts_path).with_context(|| format!("creating {}", fts_path.display()))?,
    );
    let mut bin = BufWriter::new(
        File::create(&bin_path).with_context(|| format!("creating {}", bin_path.display()))?,
    );

    writeln!(fts, "# time_ms width height spacing_x spacing_y")?;
    for (t, frame) in window.wall_clock() {
        let [sx, sy] = frame.spacing();
        writeln!(fts, "{} {} {} {} {}", t, frame.width(), frame.height(), sx, sy)?;
        match frame.pixels().as_slice() {
            Some(pixels) => bin.write_all(pixels)?,
            None => bin.write_all(&frame.pixels().iter().copied().collect::<Vec<u8>>())?,
        }
    }
    fts.flush()?;
    bin.flush()?;

    tracing::debug!("Stream {}: wrote {} frames", stream_id, window.len());
    Ok(StreamManifest {
        stream_id: stream_id.to_string(),
        sync_shift: window.sync_shift,
        frame_count: window.len(),
        timestamps_file,
        frames_file,
    })
}

fn read_stream(dir: &Path, stream: &StreamManifest) -> Result<Vec<Timestamped<Arc<ImageFrame>>>> {
    let fts_path = dir.join(&stream.timestamps_file);
    let bin_path = dir.join(&stream.frames_file);
    let pixels = fs::read(&bin_path).with_context(|| format!("reading {}", bin_path.display()))?;

    let mut frames = Vec::new();
    let mut offset = 0usize;
    for (line_no, fields) in data_lines(&fts_path)? {
        let mut tokens = fields.iter().map(String::as_str);
        let t: f64 = parse_token(tokens.next(), &fts_path, line_no)?;
        let width: usize = parse_token(tokens.next(), &fts_path, line_no)?;
        let height: usize = parse_token(tokens.next(), &fts_path, line_no)?;
        let sx: f64 = parse_token(tokens.next(), &fts_path, line_no)?;
        let sy: f64 = parse_token(tokens.next(), &fts_path, line_no)?;

        let range = width
            .checked_mul(height)
            .and_then(|len| Some(offset..offset.checked_add(len)?));
        let bytes = range.and_then(|r| pixels.get(r)).ok_or_else(|| {
            UsReconError::Persistence(format!(
                "{}: pixel data ends before frame on line {}",
                bin_path.display(),
                line_no
            ))
        })?;
        offset += bytes.len();

        let frame = ImageFrame::new(width, height, [sx, sy], bytes.to_vec())?;
        frames.push(Timestamped::new(t, Arc::new(frame)));
    }

    if frames.len() != stream.frame_count {
        tracing::warn!(
            "Stream {}: manifest lists {} frames, found {}",
            stream.stream_id,
            stream.frame_count,
            frames.len()
        );
    }
    Ok(frames)
}

fn write_tracking(path: &Path, poses: &[Timestamped<ToolPose>]) -> Result<()> {
    let mut out =
        BufWriter::new(File::create(path).with_context(|| format!("creating {}", path.display()))?);
    writeln!(out, "# time_ms tool_id m00 m01 m02 m03 m10 .. m33")?;
    for pose in poses {
        write!(out, "{} {}", pose.timestamp, pose.value.tool_id)?;
        for v in pose.value.transform.to_row_vec() {
            write!(out, " {}", v)?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn read_tracking(path: &Path) -> Result<Vec<Timestamped<ToolPose>>> {
    let mut poses = Vec::new();
    for (line_no, fields) in data_lines(path)? {
        if fields.len() != 18 {
            return Err(UsReconError::Persistence(format!(
                "{}:{}: expected 18 fields, found {}",
                path.display(),
                line_no,
                fields.len()
            )));
        }
        let t: f64 = parse_token(Some(&fields[0]), path, line_no)?;
        let values = fields[2..]
            .iter()
            .map(|v| parse_token(Some(v), path, line_no))
            .collect::<Result<Vec<f64>>>()?;
        let transform = Transform3D::from_row_slice(&values)?;
        poses.push(Timestamped::new(t, ToolPose::new(fields[1].clone(), transform)));
    }
    Ok(poses)
}

/// Non-empty, non-comment lines split on whitespace, with 1-based line numbers
fn data_lines(path: &Path) -> Result<Vec<(usize, Vec<String>)>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut lines = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        lines.push((i + 1, trimmed.split_whitespace().map(str::to_string).collect()));
    }
    Ok(lines)
}

fn parse_token<T: FromStr>(token: Option<&str>, path: &Path, line_no: usize) -> Result<T> {
    token.and_then(|t| t.parse().ok()).ok_or_else(|| {
        UsReconError::Persistence(format!("{}:{}: malformed line", path.display(), line_no))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_source::{MockImagePattern, MockTracker, MockVideoSource};
    use crate::clock::{Clock, ManualClock};
    use crate::events::EventBus;
    use crate::probe::ProbeDefinition;
    use crate::reconstruction::GridGeometry;
    use crate::session::{AcquisitionContext, SessionState};
    use crate::types::{ToolKind, TrackedTool};
    use nalgebra::Point3;
    use tempfile::tempdir;

    fn recorded_session(frames: usize) -> Arc<AcquisitionSession> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000.0));
        let (events, _rx) = EventBus::new();
        let tracker = Arc::new(MockTracker::new().with_tool(
            TrackedTool::new("probe", ToolKind::Probe)
                .with_probe(ProbeDefinition::linear([2.0, 0.0], 0.0, 6.0, 6.0))
                .with_calibration(Transform3D::from_translation(0.0, 0.0, 2.0)),
        ));
        let video = Arc::new(
            MockVideoSource::new("us0")
                .with_size(6, 5, [0.5, 0.5])
                .with_pattern(MockImagePattern::Gradient),
        );
        let context = Arc::new(
            AcquisitionContext::new(clock.clone(), events)
                .with_tracking(tracker.clone())
                .with_video_source(video.clone()),
        );

        let session = AcquisitionSession::new(1, context);
        session.start_record().unwrap();
        for i in 0..=frames {
            tracker.emit_pose(clock.now(), "probe", Transform3D::from_translation(0.0, 0.0, i as f64));
            if i < frames {
                video.generate(clock.now());
            }
            clock.advance(40.0);
        }
        session.stop_record().unwrap();
        session
    }

    #[test]
    fn test_session_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let session = recorded_session(6);

        let path = store.write_session(&session).unwrap();
        assert_eq!(path, dir.path().join(session.id()));
        assert!(path.join(MANIFEST_FILE).exists());
        assert!(path.join("us0.frames.bin").exists());

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.manifest.metadata, session.metadata());
        assert_eq!(loaded.manifest.probe_tool, session.probe_tool());
        assert_eq!(loaded.track.len(), 7);

        let (stream_id, frames) = &loaded.streams[0];
        assert_eq!(stream_id, "us0");
        let original = session.streams()[0].get_all();
        assert_eq!(frames.len(), original.len());
        for ((t, frame), stored) in original.wall_clock().zip(frames) {
            assert_eq!(t, stored.timestamp);
            assert_eq!(**frame, *stored.value);
        }
    }

    #[test]
    fn test_read_session_assembles_streams() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let session = recorded_session(6);
        let path = store.write_session(&session).unwrap();

        let inputs = store.read_session(&path).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].stream_id, "us0");
        assert_eq!(inputs[0].len(), 6);
        assert_eq!(inputs[0].calibration, Transform3D::from_translation(0.0, 0.0, 2.0));
    }

    #[test]
    fn test_idle_session_cannot_be_saved() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let (events, _rx) = EventBus::new();
        let context = Arc::new(AcquisitionContext::new(Arc::new(ManualClock::new(0.0)), events));
        let session = AcquisitionSession::new(1, context);

        assert!(matches!(
            store.write_session(&session),
            Err(UsReconError::InvalidTransition { state: SessionState::Idle, .. })
        ));
    }

    #[test]
    fn test_missing_or_corrupt_files() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        assert!(store.load(&dir.path().join("nope")).is_err());

        let session = recorded_session(3);
        let path = store.write_session(&session).unwrap();
        fs::write(path.join("us0.frames.bin"), [0u8; 7]).unwrap();
        let err = store.load(&path).unwrap_err();
        assert!(matches!(err.root(), UsReconError::Persistence(_)));
    }

    #[test]
    fn test_volume_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let geometry = GridGeometry::covering(Point3::new(-1.0, 0.0, 2.0), Point3::new(1.0, 3.0, 3.0), 0.5)
            .unwrap();
        let [nx, ny, nz] = geometry.dims;
        let data = Array3::from_shape_fn((nz, ny, nx), |(z, y, x)| (x + 10 * y + 100 * z) as f32);
        let volume = Volume::new(data, &geometry, Transform3D::from_translation(5.0, 0.0, 0.0));

        let header = store.write_volume(&volume, dir.path(), "us0").unwrap();
        let loaded = store.read_volume(&header).unwrap();
        assert_eq!(loaded, volume);

        assert!(store.write_volume(&volume, dir.path(), "../x").is_err());

        fs::write(dir.path().join("us0.volume.raw"), [0u8; 12]).unwrap();
        assert!(matches!(store.read_volume(&header), Err(UsReconError::Persistence(_))));
    }

    #[test]
    fn test_oversized_volume_header_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let geometry = GridGeometry::covering(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0), 1.0)
            .unwrap();
        let volume = Volume::new(Array3::zeros((2, 2, 2)), &geometry, Transform3D::identity());
        let header = store.write_volume(&volume, dir.path(), "us0").unwrap();

        let mut json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&header).unwrap()).unwrap();
        json["dimensions"] = serde_json::json!([usize::MAX / 2, 3, 1]);
        fs::write(&header, json.to_string()).unwrap();

        assert!(matches!(store.read_volume(&header), Err(UsReconError::Persistence(_))));
    }

    #[test]
    fn test_oversized_frame_line_is_rejected() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        let path = store.write_session(&recorded_session(2)).unwrap();

        fs::write(
            path.join("us0.fts"),
            format!("# time_ms width height spacing_x spacing_y\n0 {} 3 1 1\n", usize::MAX / 2),
        )
        .unwrap();
        let err = store.load(&path).unwrap_err();
        assert!(matches!(err.root(), UsReconError::Persistence(_)));

        // Width times height fits, but the frame runs past the pixel data
        fs::write(
            path.join("us0.fts"),
            format!("0 1 1 1 1\n40 {} 1 1 1\n", usize::MAX),
        )
        .unwrap();
        let err = store.load(&path).unwrap_err();
        assert!(matches!(err.root(), UsReconError::Persistence(_)));
    }
}
