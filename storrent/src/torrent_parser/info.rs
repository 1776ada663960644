use bencoder::bencode::Bencode;

/// One entry of a multi-file torrent's `files` list: a length and a path
/// split into components, relative to the torrent's root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: i64,
    pub path: Vec<String>,
}

/// The decoded `info` dictionary of a torrent.
///
/// Exactly one of `length` (single-file layout) and `files` (multi-file
/// layout) is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub length: Option<i64>,
    pub files: Option<Vec<FileEntry>>,
}

#[derive(Debug, PartialEq)]
pub enum FromInfoError {
    MissingName,
    MissingPieceLength,
    InvalidPieceLength,
    MissingPieces,
    MissingLength,
    AmbiguousLength,
    InvalidFiles,
    NotADict,
}

impl Info {
    pub fn from(bencode: &Bencode) -> Result<Info, FromInfoError> {
        let mut name = None;
        let mut length = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut files = None;

        let d = match bencode {
            Bencode::BDict(d) => d,
            _ => return Err(FromInfoError::NotADict),
        };

        for (k, v) in d.iter() {
            if k == b"name" {
                name = Some(Info::create_name(v)?);
            } else if k == b"length" {
                length = Some(Info::create_length(v)?);
            } else if k == b"piece length" {
                piece_length = Some(Info::create_piece_length(v)?);
            } else if k == b"pieces" {
                pieces = Some(Info::create_pieces(v)?);
            } else if k == b"files" {
                files = Some(Info::create_files(v)?);
            }
        }

        if length.is_some() && files.is_some() {
            return Err(FromInfoError::AmbiguousLength);
        }
        if length.is_none() && files.is_none() {
            return Err(FromInfoError::MissingLength);
        }

        Ok(Info {
            name: name.ok_or(FromInfoError::MissingName)?,
            piece_length: piece_length.ok_or(FromInfoError::MissingPieceLength)?,
            pieces: pieces.ok_or(FromInfoError::MissingPieces)?,
            length,
            files,
        })
    }

    /// Sum of all file lengths, the length of the flat torrent byte stream.
    pub fn total_length(&self) -> i64 {
        match (&self.length, &self.files) {
            (Some(length), _) => *length,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    fn create_name(bencode: &Bencode) -> Result<String, FromInfoError> {
        let bytes = match bencode {
            Bencode::BString(s) => s,
            _ => return Err(FromInfoError::MissingName),
        };
        String::from_utf8(bytes.to_vec()).map_err(|_| FromInfoError::MissingName)
    }

    fn create_length(bencode: &Bencode) -> Result<i64, FromInfoError> {
        match bencode {
            Bencode::BNumber(n) => Ok(*n),
            _ => Err(FromInfoError::MissingLength),
        }
    }

    fn create_piece_length(bencode: &Bencode) -> Result<i64, FromInfoError> {
        match bencode {
            Bencode::BNumber(n) if *n > 0 => Ok(*n),
            Bencode::BNumber(_) => Err(FromInfoError::InvalidPieceLength),
            _ => Err(FromInfoError::MissingPieceLength),
        }
    }

    fn create_pieces(bencode: &Bencode) -> Result<Vec<u8>, FromInfoError> {
        match bencode {
            Bencode::BString(s) => Ok(s.to_vec()),
            _ => Err(FromInfoError::MissingPieces),
        }
    }

    fn create_files(bencode: &Bencode) -> Result<Vec<FileEntry>, FromInfoError> {
        let list = match bencode {
            Bencode::BList(l) => l,
            _ => return Err(FromInfoError::InvalidFiles),
        };

        let mut files = Vec::new();
        for entry in list {
            let d = match entry {
                Bencode::BDict(d) => d,
                _ => return Err(FromInfoError::InvalidFiles),
            };
            let length = match d.get(b"length") {
                Some(Bencode::BNumber(n)) if *n >= 0 => *n,
                _ => return Err(FromInfoError::InvalidFiles),
            };
            let path = match d.get(b"path") {
                Some(Bencode::BList(parts)) if !parts.is_empty() => parts
                    .iter()
                    .map(|part| match part {
                        Bencode::BString(s) => String::from_utf8(s.to_vec())
                            .map_err(|_| FromInfoError::InvalidFiles),
                        _ => Err(FromInfoError::InvalidFiles),
                    })
                    .collect::<Result<Vec<String>, FromInfoError>>()?,
                _ => return Err(FromInfoError::InvalidFiles),
            };
            files.push(FileEntry { length, path });
        }
        if files.is_empty() {
            return Err(FromInfoError::InvalidFiles);
        }
        Ok(files)
    }
}
