/// Conversion between the text an application handles and the bytes a child reads and writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextCodec {
    /// UTF-8; invalid input decodes to U+FFFD.
    #[default]
    Utf8,
    /// ISO 8859-1; characters it cannot represent encode to `?`.
    Latin1,
}

impl TextCodec {
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextCodec::Utf8 => text.as_bytes().to_vec(),
            TextCodec::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextCodec::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextCodec::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}
