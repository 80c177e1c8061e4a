use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use opencv::core::Mat;

use crate::detection::Detection;
use crate::error::Error;

/// Tracked detections for each frame, ids stable across frames.
pub trait TrackSource {
    fn next_detections(&mut self, frame_idx: u64, frame: &Mat) -> Result<Vec<Detection>, Error>;
}

/// Replays a detections dump, one `<frame_idx>:<json array>` line per frame.
pub struct ReplaySource<R> {
    lines: Lines<R>,
    pending: Option<(u64, Vec<Detection>)>,
    line_no: usize,
}

impl ReplaySource<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> ReplaySource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            pending: None,
            line_no: 0,
        }
    }

    fn parse(line: &str) -> Result<(u64, Vec<Detection>), Error> {
        let (idx, dets) = line
            .split_once(':')
            .ok_or_else(|| Error::SourceError("missing frame index".into()))?;

        let idx = idx
            .trim()
            .parse::<u64>()
            .map_err(|err| Error::SourceError(format!("bad frame index: {}", err)))?;

        Ok((idx, serde_json::from_str(dets)?))
    }

    /// Next well-formed entry, skipping blank and malformed lines.
    fn next_entry(&mut self) -> Result<Option<(u64, Vec<Detection>)>, Error> {
        if let Some(entry) = self.pending.take() {
            return Ok(Some(entry));
        }

        for line in self.lines.by_ref() {
            let line = line?;
            self.line_no += 1;

            if line.trim().is_empty() {
                continue;
            }

            match Self::parse(&line) {
                Ok(entry) => return Ok(Some(entry)),
                Err(err) => tracing::warn!("skipping detections line {}: {}", self.line_no, err),
            }
        }

        Ok(None)
    }
}

impl<R: BufRead> TrackSource for ReplaySource<R> {
    fn next_detections(&mut self, frame_idx: u64, _frame: &Mat) -> Result<Vec<Detection>, Error> {
        while let Some((idx, dets)) = self.next_entry()? {
            if idx == frame_idx {
                return Ok(dets);
            }

            if idx > frame_idx {
                self.pending = Some((idx, dets));
                break;
            }
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const DUMP: &str = r#"0:[{"id":1,"p":0.9,"x1":10,"y1":20,"x2":110,"y2":80}]
1:not json
2:[{"id":1,"p":0.9,"x1":12,"y1":21,"x2":112,"y2":81},{"id":2,"p":0.3,"x1":300,"y1":40,"x2":350,"y2":90}]

garbage
5:[]
"#;

    #[test]
    fn replays_frames_by_index() {
        let mut source = ReplaySource::new(Cursor::new(DUMP));
        let frame = Mat::default();

        let f0 = source.next_detections(0, &frame).unwrap();
        assert_eq!(f0.len(), 1);
        assert_eq!(f0[0].track_id, 1);
        assert_eq!(f0[0].x2, 110.0);

        // malformed line for frame 1 is skipped
        assert!(source.next_detections(1, &frame).unwrap().is_empty());

        let f2 = source.next_detections(2, &frame).unwrap();
        assert_eq!(f2.len(), 2);
        assert_eq!(f2[1].confidence, 0.3);

        assert!(source.next_detections(3, &frame).unwrap().is_empty());
        assert!(source.next_detections(4, &frame).unwrap().is_empty());
        assert!(source.next_detections(5, &frame).unwrap().is_empty());
        assert!(source.next_detections(6, &frame).unwrap().is_empty());
    }

    #[test]
    fn skipped_frames_do_not_stall_replay() {
        let mut source = ReplaySource::new(Cursor::new(DUMP));
        let frame = Mat::default();

        let f2 = source.next_detections(2, &frame).unwrap();
        assert_eq!(f2.len(), 2);
    }
}
