// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `WebP` filter (`spec.md` §4.1): per-attribute lossy/lossless image
//! encode over an RGB/RGBA pixel tile. The tile's pixel extents are part of
//! the filter's own configuration (set when the attribute's filter list is
//! built), since a byte chunk alone carries no width/height.
//!
//! Built on the `image` crate's WebP codec (feature `webp`), which only
//! implements the lossless path; a filter configured with `lossless: false`
//! fails with `Error::Codec` rather than silently falling back, matching
//! `spec.md`'s note that WebP support is conditional.

use super::{FilterContext, FilterOp};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebpInputFormat {
    Rgb,
    Rgba,
}

impl WebpInputFormat {
    fn channels(self) -> u32 {
        match self {
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Rgb => 0,
            Self::Rgba => 1,
        }
    }

    fn from_tag(tag: u8) -> std::result::Result<Self, DecodeError> {
        Ok(match tag {
            0 => Self::Rgb,
            1 => Self::Rgba,
            tag => return Err(DecodeError::InvalidTag(("WebpInputFormat", tag))),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WebpFilter {
    pub input_format: WebpInputFormat,
    pub quality: f32,
    pub lossless: bool,
    pub width: u32,
    pub height: u32,
}

impl WebpFilter {
    #[must_use]
    pub fn new(
        input_format: WebpInputFormat,
        quality: f32,
        lossless: bool,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            input_format,
            quality,
            lossless,
            width,
            height,
        }
    }

    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.input_format.channels() as usize
    }
}

impl FilterOp for WebpFilter {
    #[cfg(feature = "webp")]
    fn forward(&self, input: &[u8], _ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        use image::codecs::webp::WebPEncoder;
        use image::ExtendedColorType;

        if !self.lossless {
            return Err(Error::Codec(
                "lossy WebP encoding requires libwebp, which is not linked into this build"
                    .into(),
            ));
        }
        if input.len() != self.expected_len() {
            return Err(Error::Codec(format!(
                "WebP chunk is {} bytes, expected {}x{} {:?} pixels",
                input.len(),
                self.width,
                self.height,
                self.input_format
            )));
        }

        let color_type = match self.input_format {
            WebpInputFormat::Rgb => ExtendedColorType::Rgb8,
            WebpInputFormat::Rgba => ExtendedColorType::Rgba8,
        };

        let mut out = Vec::new();
        WebPEncoder::new_lossless(&mut out)
            .encode(input, self.width, self.height, color_type)
            .map_err(|e| Error::Codec(format!("WebP encode: {e}")))?;
        Ok((Vec::new(), out))
    }

    #[cfg(not(feature = "webp"))]
    fn forward(&self, _input: &[u8], _ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        Err(Error::Codec(
            "WebP filter is not compiled into this build (missing cargo feature \"webp\")".into(),
        ))
    }

    #[cfg(feature = "webp")]
    fn reverse(
        &self,
        _metadata: &[u8],
        payload: &[u8],
        original_size: usize,
        _ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        use image::codecs::webp::WebPDecoder;
        use image::DynamicImage;

        let decoder = WebPDecoder::new(std::io::Cursor::new(payload))
            .map_err(|e| Error::Codec(format!("WebP decode: {e}")))?;
        let image = DynamicImage::from_decoder(decoder)
            .map_err(|e| Error::Codec(format!("WebP decode: {e}")))?;

        let raw = match self.input_format {
            WebpInputFormat::Rgb => image.into_rgb8().into_raw(),
            WebpInputFormat::Rgba => image.into_rgba8().into_raw(),
        };
        if raw.len() != original_size {
            return Err(Error::Codec(format!(
                "WebP decode produced {} bytes, expected {original_size}",
                raw.len()
            )));
        }
        Ok(raw)
    }

    #[cfg(not(feature = "webp"))]
    fn reverse(
        &self,
        _metadata: &[u8],
        _payload: &[u8],
        _original_size: usize,
        _ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        Err(Error::Codec(
            "WebP filter is not compiled into this build (missing cargo feature \"webp\")".into(),
        ))
    }

    fn kind_tag(&self) -> u8 {
        7
    }
}

impl Encode for WebpFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u8(self.input_format.tag())?;
        writer.write_f32::<LittleEndian>(self.quality)?;
        writer.write_u8(u8::from(self.lossless))?;
        writer.write_u32::<LittleEndian>(self.width)?;
        writer.write_u32::<LittleEndian>(self.height)?;
        Ok(())
    }
}

impl Decode for WebpFilter {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let input_format = WebpInputFormat::from_tag(reader.read_u8()?)?;
        let quality = reader.read_f32::<LittleEndian>()?;
        let lossless = reader.read_u8()? != 0;
        let width = reader.read_u32::<LittleEndian>()?;
        let height = reader.read_u32::<LittleEndian>()?;
        Ok(Self {
            input_format,
            quality,
            lossless,
            width,
            height,
        })
    }
}
