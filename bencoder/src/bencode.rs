use tracing::warn;

/// A bencoded dictionary.
///
/// Entries keep the order in which they were decoded (or inserted), so that
/// re-encoding a decoded dictionary reproduces the source bytes exactly.
/// This matters for info-hash computation, where the SHA-1 is taken over the
/// re-encoded `info` dictionary.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct BDict {
    entries: Vec<(Vec<u8>, Bencode)>,
}

impl BDict {
    pub fn new() -> BDict {
        BDict { entries: Vec::new() }
    }

    /// Inserts a key/value pair, replacing the value in place if the key
    /// already exists.
    pub fn insert(&mut self, key: Vec<u8>, value: Bencode) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Vec<u8>, Bencode)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum Bencode {
    BNumber(i64),
    BString(Vec<u8>),
    BList(Vec<Bencode>),
    BDict(BDict),
}

#[derive(PartialEq, Debug)]
pub enum BencodeError {
    InvalidBencode,
    InvalidBencodeNumber,
    InvalidBencodeString,
    InvalidBencodeList,
    InvalidBencodeDict,
}

pub trait ToBencode {
    fn to_bencode(&self) -> Bencode;
}

impl ToBencode for String {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for &str {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for i64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber(*self)
    }
}

impl ToBencode for u64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber(*self as i64)
    }
}

impl ToBencode for u32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for u16 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for i32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for Vec<u8> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.clone())
    }
}

impl ToBencode for BDict {
    fn to_bencode(&self) -> Bencode {
        Bencode::BDict(self.clone())
    }
}

impl<T: ToBencode> ToBencode for Vec<T> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BList(self.iter().map(|s| s.to_bencode()).collect())
    }
}

impl Bencode {
    /// Parses a bencoded slice of bytes into a Bencode enum.
    ///
    /// Trailing bytes after the first complete value are ignored. Malformed
    /// input yields a `BencodeError` and no partial value.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoder::bencode::Bencode;
    ///
    /// let bencode = Bencode::decode(b"5:hello").unwrap();
    /// assert_eq!(bencode, Bencode::BString(b"hello".to_vec()));
    ///
    /// let bencode = Bencode::decode(b"i123e").unwrap();
    /// assert_eq!(bencode, Bencode::BNumber(123));
    /// ```
    pub fn decode(data: &[u8]) -> Result<Bencode, BencodeError> {
        let (bencode, _) = Bencode::do_decode(data)?;
        Ok(bencode)
    }

    fn do_decode(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        match data.first() {
            Some(b'i') => Bencode::decode_number(data),
            Some(b'l') => Bencode::decode_list(data),
            Some(b'd') => Bencode::decode_dict(data),
            Some(b'0'..=b'9') => Bencode::decode_string(data),
            _ => Err(BencodeError::InvalidBencode),
        }
    }

    fn decode_string(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 0;
        while *data.get(i).ok_or(BencodeError::InvalidBencodeString)? != b':' {
            if !data[i].is_ascii_digit() {
                return Err(BencodeError::InvalidBencodeString);
            }
            i += 1;
        }
        let length = std::str::from_utf8(&data[0..i])
            .map_err(|_| BencodeError::InvalidBencodeString)?
            .parse::<usize>()
            .map_err(|_| BencodeError::InvalidBencodeString)?;

        let start = i + 1;
        let end = start
            .checked_add(length)
            .ok_or(BencodeError::InvalidBencodeString)?;
        if end > data.len() {
            return Err(BencodeError::InvalidBencodeString);
        }
        Ok((Bencode::BString(data[start..end].to_vec()), end))
    }

    fn decode_number(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        while *data.get(i).ok_or(BencodeError::InvalidBencodeNumber)? != b'e' {
            i += 1;
        }
        let digits = &data[1..i];
        Bencode::validate_number(digits)?;
        let number = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidBencodeNumber)?
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidBencodeNumber)?;
        Ok((Bencode::BNumber(number), i + 1))
    }

    // i0e is the only integer allowed to start with a zero. -0 and a bare
    // minus sign are invalid too.
    fn validate_number(digits: &[u8]) -> Result<(), BencodeError> {
        let unsigned = match digits.split_first() {
            Some((b'-', rest)) => rest,
            _ => digits,
        };
        match unsigned {
            [] => Err(BencodeError::InvalidBencodeNumber),
            [b'0'] if digits[0] == b'-' => Err(BencodeError::InvalidBencodeNumber),
            [b'0', _, ..] => Err(BencodeError::InvalidBencodeNumber),
            rest if rest.iter().all(|b| b.is_ascii_digit()) => Ok(()),
            _ => Err(BencodeError::InvalidBencodeNumber),
        }
    }

    fn decode_list(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        let mut list = Vec::new();
        while *data.get(i).ok_or(BencodeError::InvalidBencodeList)? != b'e' {
            let (value, size) = Bencode::do_decode(&data[i..])?;
            list.push(value);
            i += size;
        }
        Ok((Bencode::BList(list), i + 1))
    }

    fn decode_dict(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        let mut dict = BDict::new();
        let mut previous_key: Vec<u8> = Vec::new();
        while *data.get(i).ok_or(BencodeError::InvalidBencodeDict)? != b'e' {
            let (key, size) = Bencode::do_decode(&data[i..])?;
            i += size;
            let (value, size) = Bencode::do_decode(&data[i..])?;
            i += size;
            match key {
                Bencode::BString(key) => {
                    // Many real-world trackers ignore the sorted-keys rule.
                    if key < previous_key {
                        warn!("bencoded dictionary keys are not sorted");
                    }
                    previous_key = key.clone();
                    dict.insert(key, value);
                }
                _ => return Err(BencodeError::InvalidBencodeDict),
            };
        }
        Ok((Bencode::BDict(dict), i + 1))
    }

    /// Encodes a Bencode enum into a bencoded vec of bytes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoder::bencode::Bencode;
    ///
    /// let encoded = Bencode::encode(&String::from("spam"));
    /// assert_eq!(encoded, b"4:spam");
    ///
    /// let encoded = Bencode::encode(&123);
    /// assert_eq!(encoded, b"i123e");
    /// ```
    pub fn encode(bencode: &dyn ToBencode) -> Vec<u8> {
        Bencode::do_encode(&bencode.to_bencode())
    }

    fn do_encode(bencode: &Bencode) -> Vec<u8> {
        match bencode {
            Bencode::BNumber(n) => Bencode::encode_number(*n),
            Bencode::BString(s) => Bencode::encode_string(s),
            Bencode::BList(l) => Bencode::encode_list(l),
            Bencode::BDict(d) => Bencode::encode_dict(d),
        }
    }

    fn encode_number(n: i64) -> Vec<u8> {
        let mut encoded = vec![b'i'];
        encoded.extend(n.to_string().into_bytes());
        encoded.push(b'e');
        encoded
    }

    fn encode_string(s: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        encoded.extend(s.len().to_string().into_bytes());
        encoded.push(b':');
        encoded.extend(s);
        encoded
    }

    fn encode_list(l: &[Bencode]) -> Vec<u8> {
        let mut encoded = vec![b'l'];
        for bencode in l {
            encoded.extend(Bencode::do_encode(bencode));
        }
        encoded.push(b'e');
        encoded
    }

    fn encode_dict(d: &BDict) -> Vec<u8> {
        let mut encoded = vec![b'd'];
        for (key, value) in d.iter() {
            encoded.extend(Bencode::encode_string(key));
            encoded.extend(Bencode::do_encode(value));
        }
        encoded.push(b'e');
        encoded
    }
}

impl ToBencode for Bencode {
    fn to_bencode(&self) -> Bencode {
        self.clone()
    }
}
