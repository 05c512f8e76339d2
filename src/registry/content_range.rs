use axum::http::{HeaderName, HeaderValue};
use headers::{Error, Header};

/// The inclusive byte range a client says a chunk covers.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ContentRange {
    pub first_byte: u64,
    pub last_byte: u64,
}

impl ContentRange {
    pub fn len(&self) -> u64 {
        self.last_byte - self.first_byte + 1
    }
}

impl Header for ContentRange {
    fn name() -> &'static HeaderName {
        &::axum::http::header::CONTENT_RANGE
    }

    fn decode<'i, I: Iterator<Item = &'i HeaderValue>>(values: &mut I) -> Result<Self, Error> {
        values
            .next()
            .and_then(|v| v.to_str().ok())
            .and_then(|range| {
                // Some clients send the RFC 9110 form.
                let range = range.trim().trim_start_matches("bytes").trim_start();
                let range = range.split_once('/').map_or(range, |(range, _)| range);

                let (first_byte, last_byte) = range.split_once('-')?;
                let first_byte = first_byte.parse().ok()?;
                let last_byte = last_byte.parse().ok()?;
                if last_byte < first_byte {
                    return None;
                }

                Some(ContentRange {
                    first_byte,
                    last_byte,
                })
            })
            .ok_or_else(Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = format!("{}-{}", self.first_byte, self.last_byte);
        if let Ok(header_value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(header_value));
        }
    }
}
