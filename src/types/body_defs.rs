//! Body definitions describing what the host tracks

use serde::{Deserialize, Serialize};

use crate::{CortexError, Result};

/// Skeleton hierarchy: segment names with one parent link per segment.
///
/// Parents always point at a strictly lower index, so the links form a
/// forest and never a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    names: Vec<String>,
    parents: Vec<Option<usize>>,
}

impl Hierarchy {
    /// Build a validated hierarchy.
    pub fn new(names: Vec<String>, parents: Vec<Option<usize>>) -> Result<Self> {
        let hierarchy = Self { names, parents };
        hierarchy.validate()?;
        Ok(hierarchy)
    }

    /// Build from wire-style parent indices where any negative value marks a root.
    pub fn from_raw_parents(names: Vec<String>, raw_parents: &[i32]) -> Result<Self> {
        let parents = raw_parents.iter().map(|&p| usize::try_from(p).ok()).collect();
        Self::new(names, parents)
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.names.len() != self.parents.len() {
            return Err(CortexError::api_misuse(format!(
                "hierarchy has {} segment names but {} parent links",
                self.names.len(),
                self.parents.len()
            )));
        }

        for (index, parent) in self.parents.iter().enumerate() {
            if let Some(parent) = *parent {
                if parent >= index {
                    return Err(CortexError::api_misuse(format!(
                        "segment {} ('{}') references parent {} which is not an earlier segment",
                        index, self.names[index], parent
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn parents(&self) -> &[Option<usize>] {
        &self.parents
    }

    /// Parent links in wire form (`-1` for roots).
    pub fn raw_parents(&self) -> Vec<i32> {
        self.parents.iter().map(|p| p.map_or(-1, |p| p as i32)).collect()
    }

    /// Indices of the segments whose parent is `index`.
    pub fn children(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.parents
            .iter()
            .enumerate()
            .filter(move |(_, parent)| **parent == Some(index))
            .map(|(child, _)| child)
    }
}

/// A trackable object: markers, skeleton and degrees of freedom.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyDefinition {
    pub name: String,
    pub marker_names: Vec<String>,
    pub hierarchy: Hierarchy,
    pub dof_names: Vec<String>,
}

/// Voltage range of one analog channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    pub low: f32,
    pub high: f32,
}

/// All body definitions plus the analog configuration of the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyDefinitionSet {
    pub bodies: Vec<BodyDefinition>,
    pub analog_channel_names: Vec<String>,
    pub force_plate_count: u32,
    /// `None` when the host did not report it (older hosts).
    pub analog_bit_depth: Option<u32>,
    /// One range per analog channel, `None` when the host did not report them.
    pub analog_voltage_ranges: Option<Vec<VoltageRange>>,
}

impl BodyDefinitionSet {
    /// Find a body definition by name.
    pub fn body(&self, name: &str) -> Option<&BodyDefinition> {
        self.bodies.iter().find(|b| b.name == name)
    }

    pub fn analog_channel_count(&self) -> usize {
        self.analog_channel_names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("seg{}", i)).collect()
    }

    #[test]
    fn chain_hierarchy_validates() {
        let h = Hierarchy::from_raw_parents(names(3), &[-1, 0, 1]).unwrap();
        assert_eq!(h.parents(), &[None, Some(0), Some(1)]);
        assert_eq!(h.raw_parents(), vec![-1, 0, 1]);
        assert_eq!(h.children(0).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn forward_reference_is_rejected() {
        let err = Hierarchy::from_raw_parents(names(3), &[-1, 2, 1]).unwrap_err();
        assert!(matches!(err, CortexError::Api { .. }));
    }

    #[test]
    fn self_parent_is_rejected() {
        assert!(Hierarchy::from_raw_parents(names(2), &[-1, 1]).is_err());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert!(Hierarchy::new(names(2), vec![None]).is_err());
    }

    #[test]
    fn multiple_roots_are_allowed() {
        let h = Hierarchy::from_raw_parents(names(4), &[-1, 0, -1, 2]).unwrap();
        assert_eq!(h.children(2).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn missing_bit_depth_differs_from_zero() {
        let absent = BodyDefinitionSet { analog_bit_depth: None, ..Default::default() };
        let zero = BodyDefinitionSet { analog_bit_depth: Some(0), ..Default::default() };

        assert_ne!(absent, zero);
        assert!(absent.analog_bit_depth.is_none());
        assert_eq!(zero.analog_bit_depth, Some(0));
        assert!(absent.analog_voltage_ranges.is_none());
    }
}
