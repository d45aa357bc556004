use candle_core::{DType, Tensor};

use crate::{error::to_runtime_error, TrainingError};

/// Discriminator objective with per-scale terms for logging.
#[derive(Debug, Clone)]
pub struct DiscriminatorLoss {
    pub total: Tensor,
    pub real_losses: Vec<f32>,
    pub fake_losses: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct GeneratorAdversarialLoss {
    pub total: Tensor,
    pub per_scale: Vec<f32>,
}

/// Adversarial objective over multi-scale discriminator scores.
pub trait AdversarialLoss: Send {
    fn discriminator_loss(
        &self,
        real_scores: &[Tensor],
        fake_scores: &[Tensor],
    ) -> Result<DiscriminatorLoss, TrainingError>;

    fn generator_loss(&self, fake_scores: &[Tensor])
        -> Result<GeneratorAdversarialLoss, TrainingError>;
}

/// Least-squares GAN objective: real scores pulled to 1, fake scores to 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastSquaresLoss;

impl AdversarialLoss for LeastSquaresLoss {
    fn discriminator_loss(
        &self,
        real_scores: &[Tensor],
        fake_scores: &[Tensor],
    ) -> Result<DiscriminatorLoss, TrainingError> {
        if real_scores.len() != fake_scores.len() || real_scores.is_empty() {
            return Err(TrainingError::runtime(format!(
                "discriminator returned {} real and {} fake score sets",
                real_scores.len(),
                fake_scores.len()
            )));
        }

        let mut total: Option<Tensor> = None;
        let mut real_losses = Vec::with_capacity(real_scores.len());
        let mut fake_losses = Vec::with_capacity(fake_scores.len());
        for (real, fake) in real_scores.iter().zip(fake_scores) {
            let real_loss = squared_distance_mean(real, 1.0)?;
            let fake_loss = squared_distance_mean(fake, 0.0)?;
            real_losses.push(scalar(&real_loss)?);
            fake_losses.push(scalar(&fake_loss)?);
            let pair = real_loss.add(&fake_loss).map_err(to_runtime_error)?;
            total = Some(accumulate(total, pair)?);
        }

        Ok(DiscriminatorLoss {
            total: total.ok_or_else(|| TrainingError::runtime("empty discriminator loss"))?,
            real_losses,
            fake_losses,
        })
    }

    fn generator_loss(
        &self,
        fake_scores: &[Tensor],
    ) -> Result<GeneratorAdversarialLoss, TrainingError> {
        let mut total: Option<Tensor> = None;
        let mut per_scale = Vec::with_capacity(fake_scores.len());
        for fake in fake_scores {
            let loss = squared_distance_mean(fake, 1.0)?;
            per_scale.push(scalar(&loss)?);
            total = Some(accumulate(total, loss)?);
        }
        Ok(GeneratorAdversarialLoss {
            total: total.ok_or_else(|| TrainingError::runtime("empty generator scores"))?,
            per_scale,
        })
    }
}

/// `2 * sum(mean |real - fake|)` over every feature map. Real maps carry no
/// gradient.
pub fn feature_matching_loss(
    real_features: &[Vec<Tensor>],
    fake_features: &[Vec<Tensor>],
) -> Result<Tensor, TrainingError> {
    if real_features.len() != fake_features.len() {
        return Err(TrainingError::runtime(
            "feature map sets differ between real and fake passes",
        ));
    }
    let mut total: Option<Tensor> = None;
    for (real_maps, fake_maps) in real_features.iter().zip(fake_features) {
        if real_maps.len() != fake_maps.len() {
            return Err(TrainingError::runtime(
                "feature map depth differs between real and fake passes",
            ));
        }
        for (real, fake) in real_maps.iter().zip(fake_maps) {
            let real = real
                .detach()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let fake = fake.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let term = l1_mean(&real, &fake)?;
            total = Some(accumulate(total, term)?);
        }
    }
    total
        .ok_or_else(|| TrainingError::runtime("discriminator returned no feature maps"))?
        .affine(2.0, 0.0)
        .map_err(to_runtime_error)
}

/// KL divergence between the flowed posterior `z_p` and the prior, averaged
/// over unmasked frames.
pub fn kl_loss(
    z_p: &Tensor,
    logs_q: &Tensor,
    m_p: &Tensor,
    logs_p: &Tensor,
    z_mask: &Tensor,
) -> Result<Tensor, TrainingError> {
    let f32 = |t: &Tensor| t.to_dtype(DType::F32).map_err(to_runtime_error);
    let (z_p, logs_q, m_p, logs_p, z_mask) =
        (f32(z_p)?, f32(logs_q)?, f32(m_p)?, f32(logs_p)?, f32(z_mask)?);

    let base = logs_p
        .sub(&logs_q)
        .and_then(|t| t.affine(1.0, -0.5))
        .map_err(to_runtime_error)?;
    let inv_var = logs_p
        .affine(-2.0, 0.0)
        .and_then(|t| t.exp())
        .map_err(to_runtime_error)?;
    let spread = z_p
        .sub(&m_p)
        .and_then(|t| t.sqr())
        .and_then(|t| t.mul(&inv_var))
        .and_then(|t| t.affine(0.5, 0.0))
        .map_err(to_runtime_error)?;
    let kl = base.add(&spread).map_err(to_runtime_error)?;
    let masked = kl
        .broadcast_mul(&z_mask)
        .and_then(|t| t.sum_all())
        .map_err(to_runtime_error)?;
    let frames = z_mask.sum_all().map_err(to_runtime_error)?;
    if scalar(&frames)? <= 0.0 {
        return Err(TrainingError::runtime("kl loss received an empty mask"));
    }
    masked.div(&frames).map_err(to_runtime_error)
}

pub fn l1_mean(a: &Tensor, b: &Tensor) -> Result<Tensor, TrainingError> {
    let a = a.to_dtype(DType::F32).map_err(to_runtime_error)?;
    let b = b.to_dtype(DType::F32).map_err(to_runtime_error)?;
    a.sub(&b)
        .and_then(|t| t.abs())
        .and_then(|t| t.mean_all())
        .map_err(to_runtime_error)
}

pub fn scalar(tensor: &Tensor) -> Result<f32, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)
}

fn squared_distance_mean(scores: &Tensor, target: f64) -> Result<Tensor, TrainingError> {
    scores
        .to_dtype(DType::F32)
        .and_then(|t| t.affine(1.0, -target))
        .and_then(|t| t.sqr())
        .and_then(|t| t.mean_all())
        .map_err(to_runtime_error)
}

fn accumulate(total: Option<Tensor>, term: Tensor) -> Result<Tensor, TrainingError> {
    match total {
        Some(total) => total.add(&term).map_err(to_runtime_error),
        None => Ok(term),
    }
}
