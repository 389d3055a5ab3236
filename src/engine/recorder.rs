//! Call recording files.
//!
//! A recording is the `VREC` magic, a version byte, then one record per
//! media packet: a big-endian `u32` length followed by the packet in its
//! media-channel encoding.

use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use vipcore::media::MediaPacket;

const MAGIC: &[u8; 4] = b"VREC";
const VERSION: u8 = 1;

pub struct Recorder {
    writer: BufWriter<File>,
    path: PathBuf,
    packets: u64,
}

impl Recorder {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&[VERSION])?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            packets: 0,
        })
    }

    pub fn write(&mut self, packet: &MediaPacket) -> io::Result<()> {
        let encoded = packet.encode();
        self.writer.write_all(&(encoded.len() as u32).to_be_bytes())?;
        self.writer.write_all(&encoded)?;
        self.packets += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Flushes and closes the file, returning the number of packets.
    pub fn finish(mut self) -> io::Result<u64> {
        self.writer.flush()?;
        Ok(self.packets)
    }
}

/// Reads back every packet of a recording.
pub fn read_recording(path: &Path) -> io::Result<Vec<MediaPacket>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if &header[..4] != MAGIC || header[4] != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a recording file",
        ));
    }

    let mut packets = Vec::new();
    let mut len_buf = [0u8; 4];
    loop {
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let mut record = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        reader.read_exact(&mut record)?;
        let packet = MediaPacket::decode(Bytes::from(record))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        packets.push(packet);
    }
    Ok(packets)
}
