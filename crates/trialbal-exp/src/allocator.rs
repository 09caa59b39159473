//! Assignment rules of the in-process allocation service.

use std::collections::BTreeMap;

use trialbal_core::{Algorithm, CovariateKind, Features, ProtocolConfig};

/// Numeric encoding of a subject: continuous covariates by name, categorical
/// covariates one-hot as `{name}_is{level}`.
pub(crate) type Encoded = BTreeMap<String, f64>;

pub(crate) fn encode(config: &ProtocolConfig, features: &Features) -> Encoded {
    let mut encoded = Encoded::new();
    for spec in config.covariate_specs() {
        let Some(value) = features.get(&spec.name) else {
            continue;
        };
        match &spec.kind {
            CovariateKind::Continuous { .. } => {
                if let Some(x) = value.as_f64() {
                    encoded.insert(spec.name.clone(), x);
                }
            }
            CovariateKind::Categorical { levels } => {
                let observed = value.as_level();
                for level in levels {
                    let hit = observed == Some(level.as_str());
                    encoded.insert(format!("{}_is{}", spec.name, level), if hit { 1.0 } else { 0.0 });
                }
            }
        }
    }
    encoded
}

#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Moments {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn population_sd(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

/// Running mean and population SD per encoded dimension over every subject seen.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunningMoments {
    dims: BTreeMap<String, Moments>,
}

impl RunningMoments {
    pub(crate) fn encounter(&mut self, subject: &Encoded) {
        for (key, value) in subject {
            self.dims.entry(key.clone()).or_default().push(*value);
        }
    }

    fn z(&self, key: &str, value: f64) -> f64 {
        match self.dims.get(key) {
            Some(moments) if moments.population_sd() > 0.0 => {
                (value - moments.mean) / moments.population_sd()
            }
            _ => 0.0,
        }
    }

    fn z_length(&self, subject: &Encoded) -> f64 {
        subject
            .iter()
            .map(|(key, value)| self.z(key, *value).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn z_dot(&self, centre: &Encoded, subject: &Encoded) -> f64 {
        subject
            .iter()
            .map(|(key, value)| {
                let other = centre.get(key).copied().unwrap_or(0.0);
                self.z(key, *value) * self.z(key, other)
            })
            .sum()
    }
}

/// Chosen `(group index, pending index)` pair.
pub(crate) type Placement = (usize, usize);

/// Picks the next assignment, or `None` when nothing is pending.
///
/// `groups` holds the encoded members of each group in sorted group order;
/// `pending` holds the unassigned subjects oldest first.
pub(crate) fn place(
    algorithm: Algorithm,
    groups: &[Vec<&Encoded>],
    pending: &[&Encoded],
    moments: &RunningMoments,
) -> Option<Placement> {
    if pending.is_empty() || groups.is_empty() {
        return None;
    }
    match algorithm {
        Algorithm::Alternating => place_alternating(groups),
        Algorithm::Balanced => place_balanced(groups, pending, moments),
    }
}

fn place_alternating(groups: &[Vec<&Encoded>]) -> Option<Placement> {
    let smallest = groups.iter().map(Vec::len).min()?;
    let group = groups.iter().position(|members| members.len() == smallest)?;
    Some((group, 0))
}

fn place_balanced(
    groups: &[Vec<&Encoded>],
    pending: &[&Encoded],
    moments: &RunningMoments,
) -> Option<Placement> {
    if let Some(empty) = groups.iter().position(Vec::is_empty) {
        // seed an empty group with the most typical pending subject
        let mut best: Option<(usize, f64)> = None;
        for (idx, subject) in pending.iter().enumerate() {
            let length = moments.z_length(subject);
            if best.map_or(true, |(_, shortest)| length < shortest) {
                best = Some((idx, length));
            }
        }
        return best.map(|(idx, _)| (empty, idx));
    }

    let smallest = groups.iter().map(Vec::len).min()?;
    let mut best: Option<(Placement, f64)> = None;
    for (group_idx, members) in groups.iter().enumerate() {
        if members.len() != smallest {
            continue;
        }
        let centre = mean_vector(members);
        for (pending_idx, subject) in pending.iter().enumerate() {
            let dot = moments.z_dot(&centre, subject);
            if best.map_or(true, |(_, most_negative)| dot < most_negative) {
                best = Some(((group_idx, pending_idx), dot));
            }
        }
    }
    best.map(|(placement, _)| placement)
}

fn mean_vector(members: &[&Encoded]) -> Encoded {
    let mut sums = Encoded::new();
    for member in members {
        for (key, value) in member.iter() {
            *sums.entry(key.clone()).or_insert(0.0) += value;
        }
    }
    let n = members.len().max(1) as f64;
    sums.into_iter().map(|(key, sum)| (key, sum / n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(score: f64) -> Encoded {
        Encoded::from([("score".to_string(), score)])
    }

    #[test]
    fn moments_use_population_sd() {
        let mut moments = RunningMoments::default();
        for score in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            moments.encounter(&vector(score));
        }
        assert!((moments.z("score", 7.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn alternating_fills_first_smallest_group() {
        let a = vector(1.0);
        let groups = vec![vec![&a], vec![], vec![&a]];
        assert_eq!(place_alternating(&groups), Some((1, 0)));
    }

    #[test]
    fn balanced_pairs_opposites() {
        let mut moments = RunningMoments::default();
        let (low, typical, mid_low, high) = (vector(10.0), vector(50.0), vector(12.0), vector(88.0));
        for v in [&low, &typical, &mid_low, &high] {
            moments.encounter(v);
        }
        let groups = vec![vec![&low], vec![&typical]];
        let pending = vec![&mid_low, &high];
        // the low group takes the high subject
        assert_eq!(place_balanced(&groups, &pending, &moments), Some((0, 1)));
    }
}
