use std::path::Path;

use ndarray::prelude::*;
use opencv::{
    core::{self, Mat, Vector},
    dnn,
    prelude::*,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use crate::error::Error;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Maps a batch of package crops to raw (length, width, height) predictions
/// in the model's own units, one triple per input, in input order.
pub trait Regressor<I> {
    fn infer(&mut self, batch: &[I]) -> Result<Vec<[f32; 3]>, Error>;
}

impl<I, R: Regressor<I> + ?Sized> Regressor<I> for Box<R> {
    #[inline]
    fn infer(&mut self, batch: &[I]) -> Result<Vec<[f32; 3]>, Error> {
        (**self).infer(batch)
    }
}

/// Dimension regression network exported to ONNX, fed with BGR crops.
pub struct OnnxRegressor {
    session: Session,
    input_name: String,
    input_size: i32,
}

impl OnnxRegressor {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: i32) -> Result<Self, Error> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "input".to_string());

        tracing::info!(
            "dimension model loaded from {} (input `{}`, {}x{})",
            model_path.as_ref().display(),
            input_name,
            input_size,
            input_size
        );

        Ok(Self {
            session,
            input_name,
            input_size,
        })
    }

    /// Runs a blank image through the network to fail fast on a broken model.
    pub fn smoke_test(&mut self) -> Result<[f32; 3], Error> {
        let side = self.input_size as usize;
        let dummy = Array4::<f32>::zeros([1, 3, side, side]);
        let output = self.run(dummy)?;
        tracing::info!("dimension model smoke test output: {:?}", output[0]);

        Ok(output[0])
    }

    /// Builds the normalized NCHW tensor: RGB, resized to the network's
    /// square input, scaled to [0, 1] and standardized per channel.
    pub fn preprocess(&self, batch: &[Mat]) -> Result<Array4<f32>, Error> {
        let images = batch
            .iter()
            .map(|image| image.try_clone())
            .collect::<Result<Vector<Mat>, _>>()?;

        let blob = dnn::blob_from_images(
            &images,
            1.0 / 255.0,
            core::Size::new(self.input_size, self.input_size),
            core::Scalar::new(0., 0., 0., 0.),
            true,
            false,
            core::CV_32F,
        )?;

        let side = self.input_size as usize;
        let mut tensor =
            ArrayView4::from_shape([batch.len(), 3, side, side], blob.data_typed::<f32>()?)?
                .to_owned();

        for (c, mut channel) in tensor.axis_iter_mut(Axis(1)).enumerate() {
            channel.mapv_inplace(|v| (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
        }

        Ok(tensor)
    }

    fn run(&mut self, input: Array4<f32>) -> Result<Vec<[f32; 3]>, Error> {
        let nbatches = input.shape()[0];
        let input = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])?;

        let output = outputs[0]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix2>()?;

        if output.nrows() != nbatches || output.ncols() < 3 {
            return Err(Error::BatchSizeMismatch {
                expected: nbatches,
                got: output.nrows(),
            });
        }

        Ok(output
            .outer_iter()
            .map(|row| [row[0], row[1], row[2]])
            .collect())
    }
}

impl Regressor<Mat> for OnnxRegressor {
    fn infer(&mut self, batch: &[Mat]) -> Result<Vec<[f32; 3]>, Error> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let input = self.preprocess(batch)?;
        self.run(input)
    }
}
