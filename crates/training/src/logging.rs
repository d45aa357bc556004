use std::{
    fs::{self, File},
    io::{BufWriter, Cursor, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::TrainingError;

/// Consumer of training summaries. Only the primary worker emits.
pub trait MetricSink: Send {
    /// Records every `(tag, value)` pair for `step` or, on error, none of
    /// them.
    fn add_scalars(&mut self, step: u64, scalars: &[(String, f64)]) -> Result<(), TrainingError>;

    fn add_scalar(&mut self, tag: &str, step: u64, value: f64) -> Result<(), TrainingError> {
        self.add_scalars(step, &[(tag.to_string(), value)])
    }

    /// Row-major `rows x cols` values, e.g. a mel spectrogram.
    fn add_array2d(
        &mut self,
        tag: &str,
        step: u64,
        values: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<(), TrainingError>;

    /// Mono samples in `[-1, 1]`.
    fn add_audio(
        &mut self,
        tag: &str,
        step: u64,
        samples: &[f32],
        sampling_rate: u32,
    ) -> Result<(), TrainingError>;

    fn flush(&mut self) -> Result<(), TrainingError>;
}

/// Discards everything. Used on non-primary workers and when no log
/// directory is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn add_scalars(&mut self, _step: u64, _scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn add_array2d(
        &mut self,
        _tag: &str,
        _step: u64,
        _values: &[f32],
        _rows: usize,
        _cols: usize,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn add_audio(
        &mut self,
        _tag: &str,
        _step: u64,
        _samples: &[f32],
        _sampling_rate: u32,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Writes TensorBoard event files: scalars, 2-D float tensors and WAV audio.
pub struct TensorBoardSink {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardSink {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_value(&mut self, step: u64, value: summary::Value) -> Result<(), TrainingError> {
        self.write_values(step, vec![value])
    }

    /// One event per call, so a reader sees all of `values` or none.
    fn write_values(&mut self, step: u64, values: Vec<summary::Value>) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step: step as i64,
            summary: Some(Summary { value: values }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let mut record = Vec::with_capacity(data.len() + 16);
        record.extend_from_slice(&len_bytes);
        record.extend_from_slice(&masked_crc32(&len_bytes).to_le_bytes());
        record.extend_from_slice(&data);
        record.extend_from_slice(&masked_crc32(data.as_ref()).to_le_bytes());

        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            MetricSink::flush(self)?;
        }
        Ok(())
    }
}

impl MetricSink for TensorBoardSink {
    fn add_scalars(&mut self, step: u64, scalars: &[(String, f64)]) -> Result<(), TrainingError> {
        if scalars.is_empty() {
            return Ok(());
        }
        let values = scalars
            .iter()
            .map(|(tag, value)| summary::Value {
                tag: tag.clone(),
                simple_value: Some(*value as f32),
                ..Default::default()
            })
            .collect();
        self.write_values(step, values)
    }

    fn add_array2d(
        &mut self,
        tag: &str,
        step: u64,
        values: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<(), TrainingError> {
        if rows * cols != values.len() {
            return Err(TrainingError::runtime(format!(
                "{tag}: {} values do not fill a {rows}x{cols} array",
                values.len()
            )));
        }
        let tensor = summary::TensorProto {
            dtype: DT_FLOAT,
            tensor_shape: Some(summary::TensorShapeProto {
                dim: [rows, cols]
                    .into_iter()
                    .map(|size| summary::Dim {
                        size: size as i64,
                        name: String::new(),
                    })
                    .collect(),
            }),
            float_val: values.to_vec(),
        };
        self.write_value(
            step,
            summary::Value {
                tag: tag.to_string(),
                tensor: Some(tensor),
                ..Default::default()
            },
        )
    }

    fn add_audio(
        &mut self,
        tag: &str,
        step: u64,
        samples: &[f32],
        sampling_rate: u32,
    ) -> Result<(), TrainingError> {
        let audio = summary::Audio {
            sample_rate: sampling_rate as f32,
            num_channels: 1,
            length_frames: samples.len() as i64,
            encoded_audio_string: encode_wav(samples, sampling_rate)?,
            content_type: "audio/wav".to_string(),
        };
        self.write_value(
            step,
            summary::Value {
                tag: tag.to_string(),
                audio: Some(audio),
                ..Default::default()
            },
        )
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardSink {
    fn drop(&mut self) {
        let _ = MetricSink::flush(self);
    }
}

fn encode_wav(samples: &[f32], sampling_rate: u32) -> Result<Vec<u8>, TrainingError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: sampling_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let to_error = |err: hound::Error| TrainingError::runtime(format!("failed to encode audio: {err}"));
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(to_error)?;
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(value).map_err(to_error)?;
        }
        writer.finalize().map_err(to_error)?;
    }
    Ok(cursor.into_inner())
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

const DT_FLOAT: i32 = 1;

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
        #[prost(message, optional, tag = "6")]
        pub audio: Option<Audio>,
        #[prost(message, optional, tag = "8")]
        pub tensor: Option<TensorProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Audio {
        #[prost(float, tag = "1")]
        pub sample_rate: f32,
        #[prost(int64, tag = "2")]
        pub num_channels: i64,
        #[prost(int64, tag = "3")]
        pub length_frames: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub encoded_audio_string: Vec<u8>,
        #[prost(string, tag = "5")]
        pub content_type: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorProto {
        #[prost(int32, tag = "1")]
        pub dtype: i32,
        #[prost(message, optional, tag = "2")]
        pub tensor_shape: Option<TensorShapeProto>,
        #[prost(float, repeated, tag = "5")]
        pub float_val: Vec<f32>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorShapeProto {
        #[prost(message, repeated, tag = "2")]
        pub dim: Vec<Dim>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Dim {
        #[prost(int64, tag = "1")]
        pub size: i64,
        #[prost(string, tag = "2")]
        pub name: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_events(path: &Path) -> Vec<Event> {
        let bytes = fs::read(path).unwrap();
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&bytes[offset..offset + 8]));
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc =
                u32::from_le_bytes(bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap());
            assert_eq!(data_crc, masked_crc32(data));
            events.push(Event::decode(data).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn records_scalars_arrays_and_audio() {
        let dir = tempdir().unwrap();
        let mut sink = TensorBoardSink::create(dir.path(), 100).unwrap();
        sink.add_scalar("loss/g/total", 7, 1.5).unwrap();
        sink.add_array2d("slice/mel_org", 7, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 2, 3)
            .unwrap();
        sink.add_audio("gen/audio", 7, &[0.0, 0.5, -0.5, 1.0], 16_000)
            .unwrap();
        MetricSink::flush(&mut sink).unwrap();

        let events = read_events(sink.path());
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.step == 7));

        let scalar = &events[0].summary.as_ref().unwrap().value[0];
        assert_eq!(scalar.tag, "loss/g/total");
        assert_eq!(scalar.simple_value, Some(1.5));

        let tensor = events[1].summary.as_ref().unwrap().value[0].tensor.clone().unwrap();
        let dims: Vec<i64> = tensor.tensor_shape.unwrap().dim.iter().map(|d| d.size).collect();
        assert_eq!(dims, vec![2, 3]);
        assert_eq!(tensor.float_val.len(), 6);

        let audio = events[2].summary.as_ref().unwrap().value[0].audio.clone().unwrap();
        assert_eq!(audio.length_frames, 4);
        let reader = hound::WavReader::new(Cursor::new(audio.encoded_audio_string)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn scalar_batch_is_a_single_event() {
        let dir = tempdir().unwrap();
        let mut sink = TensorBoardSink::create(dir.path(), 100).unwrap();
        let scalars = vec![
            ("loss/g/total".to_string(), 2.0),
            ("loss/d/total".to_string(), 0.5),
            ("learning_rate".to_string(), 1e-4),
        ];
        sink.add_scalars(3, &scalars).unwrap();
        sink.add_scalars(4, &[]).unwrap();
        MetricSink::flush(&mut sink).unwrap();

        let events = read_events(sink.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].step, 3);
        let tags: Vec<&str> = events[0]
            .summary
            .as_ref()
            .unwrap()
            .value
            .iter()
            .map(|value| value.tag.as_str())
            .collect();
        assert_eq!(tags, vec!["loss/g/total", "loss/d/total", "learning_rate"]);
    }

    #[test]
    fn rejects_ragged_arrays() {
        let dir = tempdir().unwrap();
        let mut sink = TensorBoardSink::create(dir.path(), 1).unwrap();
        assert!(sink.add_array2d("x", 0, &[1.0, 2.0, 3.0], 2, 2).is_err());
    }
}
