//! Euler ancestral sampling with noise drawn on the host, so a seed
//! reproduces the same image on every device, CPU included.

use anyhow::{bail, Result};
use candle_core::{Device, Shape, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const STEPS_OFFSET: usize = 1;

/// Seeded source of standard normal noise.
pub struct Noise {
    rng: StdRng,
}

impl Noise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(values, shape, device)?)
    }
}

/// Scaled-linear beta schedule with "leading" timestep spacing and epsilon
/// prediction, the SDXL training setup.
#[derive(Debug, Clone)]
pub struct EulerAncestral {
    timesteps: Vec<usize>,
    /// One sigma per step plus a trailing zero.
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
}

impl EulerAncestral {
    pub fn new(steps: usize) -> Result<Self> {
        if steps == 0 || steps > TRAIN_TIMESTEPS {
            bail!("steps must be between 1 and {TRAIN_TIMESTEPS}, got {steps}");
        }
        let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let mut alpha_cumprod = 1.0;
        let train_sigmas: Vec<f64> = (0..TRAIN_TIMESTEPS)
            .map(|t| {
                let beta = (start + (end - start) * t as f64 / (TRAIN_TIMESTEPS - 1) as f64).powi(2);
                alpha_cumprod *= 1.0 - beta;
                ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
            })
            .collect();

        let ratio = TRAIN_TIMESTEPS / steps;
        let timesteps: Vec<usize> = (0..steps)
            .rev()
            .map(|step| (step * ratio + STEPS_OFFSET).min(TRAIN_TIMESTEPS - 1))
            .collect();
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| train_sigmas[t]).collect();
        sigmas.push(0.0);
        let max_sigma = sigmas.iter().copied().fold(0.0, f64::max);

        Ok(Self {
            timesteps,
            sigmas,
            init_noise_sigma: (max_sigma * max_sigma + 1.0).sqrt(),
        })
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    /// Scales the UNet input for step `index`.
    pub fn scale_model_input(&self, sample: &Tensor, index: usize) -> Result<Tensor> {
        let sigma = self.sigmas[index];
        Ok((sample / (sigma * sigma + 1.0).sqrt())?)
    }

    /// Advances `sample` from step `index` to the next one.
    pub fn step(
        &self,
        noise_pred: &Tensor,
        index: usize,
        sample: &Tensor,
        noise: &mut Noise,
    ) -> Result<Tensor> {
        let sigma_from = self.sigmas[index];
        let sigma_to = self.sigmas[index + 1];
        let sigma_up =
            (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt();
        let sigma_down = sigma_to.powi(2) / sigma_from;

        // With epsilon prediction the ODE derivative is the predicted noise.
        let prev = (sample + (noise_pred * (sigma_down - sigma_from))?)?;
        if sigma_up == 0.0 {
            return Ok(prev);
        }
        let fresh = noise
            .randn(sample.dims(), &Device::Cpu)?
            .to_device(sample.device())?
            .to_dtype(sample.dtype())?;
        Ok((prev + (fresh * sigma_up)?)?)
    }
}
