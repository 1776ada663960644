use std::{
    fs::File,
    io::{BufReader, Error, Read},
    path::Path,
};

use super::torrent::{FromTorrentError, MetaInfo};
use bencoder::bencode::{Bencode, BencodeError};

#[derive(Debug)]
pub enum ParseError {
    IoError(Error),
    BencodeError(BencodeError),
    FromTorrentError(FromTorrentError),
}

pub struct TorrentParser;

impl TorrentParser {
    /// Given a path to a torrent file, parses the file and returns a
    /// `MetaInfo` struct.
    ///
    /// # Errors
    ///
    /// * `ParseError::IoError` - An error occurred while reading the file
    /// * `ParseError::BencodeError` - An error occurred while parsing the bencode
    /// * `ParseError::FromTorrentError` - An error occurred while creating the MetaInfo struct
    pub fn parse(filepath: &Path) -> Result<MetaInfo, ParseError> {
        let buffer = TorrentParser::read_file(filepath).map_err(ParseError::IoError)?;
        TorrentParser::parse_bytes(&buffer)
    }

    /// Parses an in-memory `.torrent` byte buffer.
    pub fn parse_bytes(buffer: &[u8]) -> Result<MetaInfo, ParseError> {
        let bencode = Bencode::decode(buffer).map_err(ParseError::BencodeError)?;
        MetaInfo::from(bencode).map_err(ParseError::FromTorrentError)
    }

    fn read_file(filepath: &Path) -> Result<Vec<u8>, Error> {
        let file = File::open(filepath)?;
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();

        reader.read_to_end(&mut buffer)?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write, path::PathBuf};

    #[test]
    fn test_parse_torrent() {
        let filepath = PathBuf::from("./test_parse_torrent.torrent");
        let contents =
            b"d8:announce35:https://torrent.ubuntu.com/announce4:infod6:lengthi3654957056e4:name30:ubuntu-22.04-desktop-amd64.iso12:piece lengthi262144e6:pieces64:<hex>BC 07 C0 6A 9D BC 07 C0 6A 9D BC 07 C0 6A 9D BC 07 C0 6A 9Dee";
        create_and_write_file(&filepath, contents);

        let meta_info = match TorrentParser::parse(&filepath) {
            Ok(meta_info) => meta_info,
            Err(e) => {
                remove_file(&filepath);
                panic!("{:?}", e);
            }
        };
        remove_file(&filepath);

        assert_eq!(
            meta_info.announce_list,
            vec![vec![String::from("https://torrent.ubuntu.com/announce")]]
        );
        assert_eq!(meta_info.info.length, Some(3654957056));
        assert_eq!(meta_info.info.name, "ubuntu-22.04-desktop-amd64.iso");
        assert_eq!(meta_info.info.piece_length, 262144);
        assert_eq!(
            meta_info.info_hash.to_hex(),
            "48442ddee1900ed8c8101bb8b2bd955060f1eabc"
        );
    }

    #[test]
    fn test_parse_missing_file() {
        let result = TorrentParser::parse(Path::new("./does_not_exist.torrent"));
        assert!(matches!(result, Err(ParseError::IoError(_))));
    }

    #[test]
    fn test_parse_garbage() {
        let result = TorrentParser::parse_bytes(b"not bencode at all");
        assert!(matches!(result, Err(ParseError::BencodeError(_))));
    }

    fn create_and_write_file(path: &Path, contents: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }

    fn remove_file(path: &Path) {
        fs::remove_file(path).unwrap();
    }
}
