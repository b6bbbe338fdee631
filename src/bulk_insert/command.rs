//! PUT command encoding
//!
//! Each stored document becomes one element of the request body array:
//!
//! ```text
//! {"Id":"users/1","Type":"PUT","Document":{...},"@metadata":{"@collection":"Users"}}
//! ```

use crate::bulk_insert::buffer::EncodingBuffer;
use crate::conventions::{EntityEncoder, Metadata};
use crate::error::BulkInsertError;
use serde_json::Value;
use std::io::Write;

/// One document write, borrowed for the duration of its encoding
pub struct PutCommand<'a> {
    pub id: &'a str,
    pub document: &'a Value,
    pub metadata: &'a Metadata,
}

impl PutCommand<'_> {
    /// Append the command to `buffer`, preceded by a comma unless `first`
    ///
    /// On failure the buffer is rolled back to where it was, so it never
    /// holds a partial command.
    pub fn encode(
        &self,
        buffer: &mut EncodingBuffer,
        first: bool,
        encoder: Option<&dyn EntityEncoder>,
    ) -> Result<(), BulkInsertError> {
        let start = buffer.len();
        let result = self.encode_unchecked(buffer, first, encoder);
        if result.is_err() {
            buffer.truncate(start);
        }
        result
    }

    fn encode_unchecked(
        &self,
        buffer: &mut EncodingBuffer,
        first: bool,
        encoder: Option<&dyn EntityEncoder>,
    ) -> Result<(), BulkInsertError> {
        if !first {
            buffer.push(b',');
        }
        buffer.extend_from_slice(b"{\"Id\":");
        serde_json::to_writer(&mut *buffer, self.id)?;
        buffer.extend_from_slice(b",\"Type\":\"PUT\",\"Document\":");

        let custom_entity = match encoder {
            Some(encoder) => encoder.try_encode_entity(self.document, &mut *buffer)?,
            None => false,
        };
        if !custom_entity {
            serde_json::to_writer(&mut *buffer, self.document)?;
        }

        buffer.extend_from_slice(b",\"@metadata\":");
        let custom_metadata = match encoder {
            Some(encoder) => encoder.try_encode_metadata(self.metadata, &mut *buffer)?,
            None => false,
        };
        if !custom_metadata {
            serde_json::to_writer(&mut *buffer, self.metadata)?;
        }

        buffer.write_all(b"}")?;
        Ok(())
    }
}
