//! Metrics sinks.
//!
//! Scalars and free-form records go to a JSON-lines file; representation
//! images are written next to it under `images/`.

use crate::error::SinkError;
use crate::params::{IMAGE_DIR_NAME, METRICS_FILE_NAME};
use crate::visualize::GridImage;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub trait MetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SinkError>;

    fn add_image(&mut self, name: &str, image: &GridImage, step: u64) -> Result<(), SinkError>;

    /// Free-form structured record (configuration, run summary)
    fn add_record(&mut self, record: &serde_json::Value) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct ScalarLine<'a> {
    ts: String,
    kind: &'static str,
    name: &'a str,
    step: u64,
    value: f64,
}

#[derive(Serialize)]
struct ImageLine<'a> {
    ts: String,
    kind: &'static str,
    name: &'a str,
    step: u64,
    path: String,
    height: usize,
    width: usize,
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Appends one JSON object per line to `<dir>/metrics.jsonl`
pub struct JsonlSink {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(dir: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(dir)?;
        let f = OpenOptions::new().create(true).append(true).open(dir.join(METRICS_FILE_NAME))?;
        Ok(Self { dir: dir.to_path_buf(), writer: BufWriter::with_capacity(1 << 16, f) })
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_FILE_NAME)
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, value)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn image_path(&self, name: &str, step: u64, extension: &str) -> PathBuf {
        let stem = name.replace('/', "_");
        self.dir.join(IMAGE_DIR_NAME).join(format!("{stem}_{step:08}.{extension}"))
    }
}

impl MetricsSink for JsonlSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SinkError> {
        self.write_line(&ScalarLine { ts: timestamp(), kind: "scalar", name, step, value })
    }

    fn add_image(&mut self, name: &str, image: &GridImage, step: u64) -> Result<(), SinkError> {
        let path = self.image_path(name, step, IMAGE_EXTENSION);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_image(&path, image)?;
        self.write_line(&ImageLine {
            ts: timestamp(),
            kind: "image",
            name,
            step,
            path: path.display().to_string(),
            height: image.height,
            width: image.width,
        })
    }

    fn add_record(&mut self, record: &serde_json::Value) -> Result<(), SinkError> {
        self.write_line(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(feature = "plots")]
const IMAGE_EXTENSION: &str = "png";
#[cfg(not(feature = "plots"))]
const IMAGE_EXTENSION: &str = "ppm";

#[cfg(feature = "plots")]
fn write_image(path: &Path, image: &GridImage) -> Result<(), SinkError> {
    use plotters::prelude::*;
    let root = BitMapBackend::new(path, (image.width as u32, image.height as u32)).into_drawing_area();
    for y in 0..image.height {
        for x in 0..image.width {
            let color = RGBColor(image.pixel(0, y, x), image.pixel(1, y, x), image.pixel(2, y, x));
            root.draw_pixel((x as i32, y as i32), &color).map_err(|e| SinkError::Image(e.to_string()))?;
        }
    }
    root.present().map_err(|e| SinkError::Image(e.to_string()))?;
    Ok(())
}

/// Binary PPM (P6)
#[cfg(not(feature = "plots"))]
fn write_image(path: &Path, image: &GridImage) -> Result<(), SinkError> {
    let mut w = BufWriter::new(File::create(path)?);
    write!(w, "P6\n{} {}\n255\n", image.width, image.height)?;
    w.write_all(&image.to_rgb_interleaved())?;
    w.flush()?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageRecord {
    pub name: String,
    pub step: u64,
    pub image: GridImage,
}

/// Keeps everything in memory
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    pub scalars: Vec<ScalarRecord>,
    pub images: Vec<ImageRecord>,
    pub records: Vec<serde_json::Value>,
    pub flushes: usize,
}

impl RecordingSink {
    /// `(step, value)` pairs recorded under `name`, in arrival order
    pub fn series(&self, name: &str) -> Vec<(u64, f64)> {
        self.scalars.iter().filter(|s| s.name == name).map(|s| (s.step, s.value)).collect()
    }
}

impl MetricsSink for RecordingSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SinkError> {
        self.scalars.push(ScalarRecord { name: name.to_string(), value, step });
        Ok(())
    }

    fn add_image(&mut self, name: &str, image: &GridImage, step: u64) -> Result<(), SinkError> {
        self.images.push(ImageRecord { name: name.to_string(), step, image: image.clone() });
        Ok(())
    }

    fn add_record(&mut self, record: &serde_json::Value) -> Result<(), SinkError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_writes_scalars_records_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::create(dir.path()).unwrap();
        sink.add_scalar("training/loss", 0.75, 12).unwrap();
        sink.add_record(&serde_json::json!({"phase": "config", "lr": 1e-4})).unwrap();
        let image = GridImage { height: 2, width: 2, data: vec![7; 12] };
        sink.add_image("validation/representation", &image, 12).unwrap();
        sink.flush().unwrap();

        let text = fs::read_to_string(sink.metrics_path()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["name"], "training/loss");
        assert_eq!(lines[0]["step"], 12);
        assert_eq!(lines[0]["value"], 0.75);
        assert_eq!(lines[1]["phase"], "config");
        let path = PathBuf::from(lines[2]["path"].as_str().unwrap());
        assert!(path.exists());
        assert!(
            path.file_name().unwrap().to_string_lossy().starts_with("validation_representation_00000012.")
        );
    }

    #[test]
    fn recording_sink_collects_series() {
        let mut sink = RecordingSink::default();
        sink.add_scalar("training/loss", 1.0, 1).unwrap();
        sink.add_scalar("validation/loss", 2.0, 1).unwrap();
        sink.add_scalar("training/loss", 0.5, 2).unwrap();
        assert_eq!(sink.series("training/loss"), vec![(1, 1.0), (2, 0.5)]);
        sink.flush().unwrap();
        assert_eq!(sink.flushes, 1);
    }
}
