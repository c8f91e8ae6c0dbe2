//! Channel routing matrices.

use crate::channel::{ChannelLayout, position_distance};

/// A dense `inputs x outputs` matrix of mix coefficients. Row per source
/// channel, column per destination channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelMatrix {
    inputs: u8,
    outputs: u8,
    coefficients: Vec<f32>,
}

impl ChannelMatrix {
    /// All-zero matrix.
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs: inputs as u8,
            outputs: outputs as u8,
            coefficients: vec![0.0; inputs * outputs],
        }
    }

    /// Identity mapping for square routing.
    pub fn identity(channels: usize) -> Self {
        let mut matrix = Self::new(channels, channels);
        for c in 0..channels {
            matrix.set(c, c, 1.0);
        }
        matrix
    }

    /// Generates a routing matrix by speaker-position proximity:
    /// 1. Source channels with an exactly-matching destination position
    ///    connect with weight 1.
    /// 2. Every unmatched source channel splits between the two closest
    ///    destination channels, weighted by complementary angular distance
    ///    (the weights sum to 1).
    /// 3. A mono destination receives every source channel at weight 1.
    pub fn from_layouts(src: &ChannelLayout, dst: &ChannelLayout) -> Self {
        let mut matrix = Self::new(src.count(), dst.count());
        debug_assert!(src.count() > 0);
        debug_assert!(dst.count() > 0);
        if dst.count() == 1 {
            for src_c in 0..src.count() {
                matrix.set(src_c, 0, 1.0);
            }
            return matrix;
        }
        let mut matched = [false; crate::MAX_CHANNELS];
        for src_c in 0..src.count() {
            for dst_c in 0..dst.count() {
                if src.position(src_c) == dst.position(dst_c) {
                    matched[src_c] = true;
                    matrix.set(src_c, dst_c, 1.0);
                    break;
                }
            }
        }
        for src_c in 0..src.count() {
            if matched[src_c] {
                continue;
            }
            let mut distances: Vec<(u16, usize)> = (0..dst.count())
                .map(|dst_c| (position_distance(src.position(src_c), dst.position(dst_c)), dst_c))
                .collect();
            distances.sort_by_key(|&(dist, _)| dist);
            let (dist0, dst0) = distances[0];
            let (dist1, dst1) = distances[1];
            let total = (dist0 + dist1) as f32;
            matrix.set(src_c, dst0, 1.0 - dist0 as f32 / total);
            matrix.set(src_c, dst1, 1.0 - dist1 as f32 / total);
        }
        matrix
    }

    #[inline]
    pub fn inputs(&self) -> usize {
        self.inputs as usize
    }

    #[inline]
    pub fn outputs(&self) -> usize {
        self.outputs as usize
    }

    #[inline]
    pub fn get(&self, input: usize, output: usize) -> f32 {
        self.coefficients[input * self.outputs as usize + output]
    }

    #[inline]
    pub fn set(&mut self, input: usize, output: usize, value: f32) {
        self.coefficients[input * self.outputs as usize + output] = value;
    }

    /// Coefficients routing one input channel to every output.
    #[inline]
    pub fn row(&self, input: usize) -> &[f32] {
        let outputs = self.outputs as usize;
        &self.coefficients[input * outputs..(input + 1) * outputs]
    }

    pub fn is_identity(&self) -> bool {
        if self.inputs != self.outputs {
            return false;
        }
        for i in 0..self.inputs() {
            for o in 0..self.outputs() {
                let expected = if i == o { 1.0 } else { 0.0 };
                if self.get(i, o) != expected {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn matching_positions_connect_directly() {
        let matrix =
            ChannelMatrix::from_layouts(&ChannelLayout::stereo(), &ChannelLayout::surround_5_1());
        assert_eq!(matrix.get(0, 0), 1.0);
        assert_eq!(matrix.get(1, 1), 1.0);
        assert_eq!(matrix.get(0, 1), 0.0);
    }

    #[test]
    fn mono_destination_takes_everything() {
        let matrix =
            ChannelMatrix::from_layouts(&ChannelLayout::surround_5_1(), &ChannelLayout::mono());
        for input in 0..matrix.inputs() {
            assert_eq!(matrix.get(input, 0), 1.0);
        }
    }

    #[test]
    fn unmatched_channels_split_to_two_nearest() {
        let matrix =
            ChannelMatrix::from_layouts(&ChannelLayout::surround_5_1(), &ChannelLayout::stereo());
        // Fronts match directly.
        assert_eq!(matrix.get(0, 0), 1.0);
        assert_eq!(matrix.get(1, 1), 1.0);
        // Center, sub, and surrounds each split with weights summing to 1.
        for input in 2..matrix.inputs() {
            let sum: f32 = matrix.row(input).iter().sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
        }
        // Center splits evenly.
        assert_abs_diff_eq!(matrix.get(2, 0), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(matrix.get(2, 1), 0.5, epsilon = 1e-6);
        // Back-left leans left.
        assert!(matrix.get(4, 0) > matrix.get(4, 1));
    }

    #[test]
    fn identity_detection() {
        assert!(ChannelMatrix::identity(4).is_identity());
        let mut not_identity = ChannelMatrix::identity(4);
        not_identity.set(0, 1, 0.5);
        assert!(!not_identity.is_identity());
    }
}
