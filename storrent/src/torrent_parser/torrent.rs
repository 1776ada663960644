use std::path::PathBuf;

use sha1::{Digest, Sha1};

use bencoder::bencode::Bencode;

use crate::byte_string::InfoHash;

use super::info::{FromInfoError, Info};

/// A file declared by the torrent: its path within the torrent and its
/// length. The declared order of these records defines the flat torrent
/// byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInTorrent {
    pub path: PathBuf,
    pub length: u64,
}

/// A parsed `.torrent` descriptor.
///
/// `announce_list` is a list of tiers, each a list of tracker URLs; when the
/// source carries only the flat `announce` key it becomes one single-URL
/// tier.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaInfo {
    pub announce_list: Vec<Vec<String>>,
    pub info: Info,
    pub info_hash: InfoHash,
}

#[derive(Debug, PartialEq)]
pub enum FromTorrentError {
    MissingAnnounce,
    MissingInfo,
    FromInfoError(FromInfoError),
    NotADict,
}

impl MetaInfo {
    pub fn from(bencode: Bencode) -> Result<MetaInfo, FromTorrentError> {
        let d = match &bencode {
            Bencode::BDict(d) => d,
            _ => return Err(FromTorrentError::NotADict),
        };

        let info_value = d.get(b"info").ok_or(FromTorrentError::MissingInfo)?;
        let info = Info::from(info_value).map_err(FromTorrentError::FromInfoError)?;

        // The hash is taken over the re-encoding of the decoded info value,
        // which is byte-identical to the source since dictionaries keep
        // their order.
        let digest = Sha1::digest(Bencode::encode(info_value));
        let info_hash = InfoHash::try_from(digest.as_slice())
            .expect("SHA-1 digests are 20 bytes");

        let mut announce_list = MetaInfo::create_announce_list(d.get(b"announce-list"));
        if announce_list.is_empty() {
            let announce = MetaInfo::create_announce(d.get(b"announce"))?;
            announce_list = vec![vec![announce]];
        }

        Ok(MetaInfo {
            announce_list,
            info,
            info_hash,
        })
    }

    fn create_announce(bencode: Option<&Bencode>) -> Result<String, FromTorrentError> {
        let announce = match bencode {
            Some(Bencode::BString(s)) => s,
            _ => return Err(FromTorrentError::MissingAnnounce),
        };
        String::from_utf8(announce.to_vec()).map_err(|_| FromTorrentError::MissingAnnounce)
    }

    // Tiers that fail to parse are skipped rather than failing the torrent;
    // the flat announce key still works as a fallback.
    fn create_announce_list(bencode: Option<&Bencode>) -> Vec<Vec<String>> {
        let tiers = match bencode {
            Some(Bencode::BList(tiers)) => tiers,
            _ => return Vec::new(),
        };

        let mut announce_list = Vec::new();
        for tier in tiers {
            let urls = match tier {
                Bencode::BList(urls) => urls,
                _ => continue,
            };
            let mut parsed = Vec::new();
            for url in urls {
                if let Bencode::BString(s) = url {
                    if let Ok(url) = String::from_utf8(s.to_vec()) {
                        parsed.push(url);
                    }
                }
            }
            if !parsed.is_empty() {
                announce_list.push(parsed);
            }
        }
        announce_list
    }

    /// Returns the name of the torrent.
    pub fn name(&self) -> String {
        self.info.name.clone()
    }

    /// Returns the length in bytes of the flat torrent stream.
    pub fn total_length(&self) -> u64 {
        self.info.total_length().max(0) as u64
    }

    /// Returns the nominal size of a piece.
    pub fn piece_length(&self) -> u64 {
        self.info.piece_length as u64
    }

    /// Returns the number of pieces of the torrent.
    pub fn piece_count(&self) -> u64 {
        self.total_length().div_ceil(self.piece_length())
    }

    /// Returns the length of the piece at `index`; only the last piece may
    /// be shorter than the nominal length.
    pub fn piece_length_at(&self, index: u64) -> u64 {
        if index == self.piece_count() - 1 && self.total_length() % self.piece_length() > 0 {
            self.total_length() % self.piece_length()
        } else {
            self.piece_length()
        }
    }

    /// Returns the declared SHA-1 of the piece at `index`.
    pub fn piece_hash(&self, index: u64) -> Option<&[u8]> {
        let start = (index as usize).checked_mul(20)?;
        self.info.pieces.get(start..start + 20)
    }

    /// The torrent's files in declared order, with paths relative to the
    /// torrent root (the root directory name is not included).
    pub fn files_in_torrent(&self) -> Vec<FileInTorrent> {
        match &self.info.files {
            Some(files) => files
                .iter()
                .map(|f| FileInTorrent {
                    path: f.path.iter().collect(),
                    length: f.length.max(0) as u64,
                })
                .collect(),
            None => vec![FileInTorrent {
                path: PathBuf::from(&self.info.name),
                length: self.total_length(),
            }],
        }
    }

    /// The directory all files are placed under, present only for
    /// multi-file torrents.
    pub fn root_dir_name(&self) -> Option<String> {
        self.info.files.as_ref().map(|_| self.info.name.clone())
    }
}
