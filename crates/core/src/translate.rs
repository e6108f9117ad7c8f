//! Single-image translation: buffer → tensor → generator → buffer.

use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use ndarray::Axis;
use tracing::{debug, info};

use crate::codec::{decode_image, encode_png};
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::model_id::ModelId;
use crate::model_store::ModelStore;
use crate::tensor::{to_input_tensor, to_pixel_buffer};

/// Run one image through `generator` at `resolution × resolution`.
///
/// The result has the generator's output size, not the input's.
pub fn translate(image: &RgbImage, generator: &dyn Generator, resolution: u32) -> Result<RgbImage> {
    let input = to_input_tensor(image, resolution).insert_axis(Axis(0));
    debug!(shape = ?input.shape(), "generator input");

    let output = generator.forward(input)?;
    if output.shape()[0] != 1 {
        return Err(Error::Shape(format!(
            "expected a single batch item, got shape {:?}",
            output.shape()
        )));
    }

    to_pixel_buffer(output.index_axis(Axis(0), 0))
}

/// Resolves identifiers through a shared [`ModelStore`] and translates at a
/// fixed resolution.
#[derive(Clone)]
pub struct Translator {
    store: Arc<ModelStore>,
    resolution: u32,
}

impl Translator {
    pub fn new(store: Arc<ModelStore>, resolution: u32) -> Self {
        Self { store, resolution }
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn translate_with(&self, model: ModelId, image: &RgbImage) -> Result<RgbImage> {
        let generator = self.store.get_model(model)?;
        let started = Instant::now();
        let output = translate(image, generator.as_ref(), self.resolution)?;
        info!(
            model = %model,
            width = image.width(),
            height = image.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Translated image"
        );
        Ok(output)
    }

    /// Decode, translate, and PNG-encode.
    pub fn translate_bytes(&self, model: ModelId, bytes: &[u8]) -> Result<Vec<u8>> {
        let image = decode_image(bytes)?;
        let output = self.translate_with(model, &image)?;
        encode_png(&output)
    }
}
