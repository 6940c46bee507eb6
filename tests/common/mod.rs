#![allow(dead_code)]
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use magstream::config::{Device, QoS};
use magstream::dispatch::{Publisher, StorageWriter};
use magstream::BoxError;

pub const OBSDAQ_LINE: &str = ":R,00,200131.143739.617,*0259FEFFF1BFFFFCEDL:04AC11CC000B000B000B";

/// A POS-1 frame padded with NULs to the device frame length.
pub fn pos1_frame(intensity: u32, time: &str) -> Vec<u8> {
    let mut data = format!("{intensity:08} +- 00012 [00] 01-31-20 {time}").into_bytes();
    data.resize(Device::POS1_FRAME_LEN, 0);
    data
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
}

/// Publisher recording every message; fails every publish to `fail_topic`.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<Message>>,
    pub fail_topic: Option<String>,
}

impl RecordingSink {
    pub fn failing(topic: &str) -> Self {
        RecordingSink {
            fail_topic: Some(topic.to_string()),
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn payloads(&self, suffix: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic.ends_with(suffix))
            .map(|m| m.payload)
            .collect()
    }
}

impl Publisher for RecordingSink {
    fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<(), BoxError> {
        if self.fail_topic.as_deref() == Some(topic) {
            return Err(format!("no route to {topic}").into());
        }
        self.messages.lock().unwrap().push(Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stored {
    pub directory: PathBuf,
    pub sensor_id: String,
    pub filename: String,
    pub payload: Vec<u8>,
    pub header: String,
}

#[derive(Default)]
pub struct MemoryStorage(pub Mutex<Vec<Stored>>);

impl StorageWriter for MemoryStorage {
    fn write_record(
        &self,
        directory: &Path,
        sensor_id: &str,
        date_filename: &str,
        payload: &[u8],
        header: &str,
    ) -> std::io::Result<()> {
        self.0.lock().unwrap().push(Stored {
            directory: directory.to_path_buf(),
            sensor_id: sensor_id.to_string(),
            filename: date_filename.to_string(),
            payload: payload.to_vec(),
            header: header.to_string(),
        });
        Ok(())
    }
}

/// Storage writer failing every write.
pub struct FailingStorage;

impl StorageWriter for FailingStorage {
    fn write_record(&self, _: &Path, _: &str, _: &str, _: &[u8], _: &str) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only buffer",
        ))
    }
}
