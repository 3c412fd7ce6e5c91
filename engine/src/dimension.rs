//! FILENAME: core/engine/src/dimension.rs
//! PURPOSE: In-memory dimension: an arena of elements with weighted hierarchy.
//! CONTEXT: Cubes only read dimensions. Elements are addressed by dense
//! identifiers (their arena index). Children lists are the source of truth;
//! parents, levels and depths are recomputed into the arena by `rebuild()`
//! after every hierarchy edit instead of being patched in place.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cell::{DimensionId, ElementId};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Numeric,
    String,
    Consolidated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub name: String,
    pub element_type: ElementType,
    /// Ordered (child, weight) pairs. Only consolidated elements have children.
    pub children: Vec<(ElementId, f64)>,
    /// Recomputed by `Dimension::rebuild`.
    pub parents: Vec<ElementId>,
    /// Distance to the deepest base descendant (0 for base elements).
    pub level: u32,
    /// Distance to the nearest root.
    pub depth: u32,
}

impl Element {
    pub fn is_consolidated(&self) -> bool {
        self.element_type == ElementType::Consolidated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    pub id: DimensionId,
    pub name: String,
    /// Arena indexed by element id. Deleted slots stay `None` so ids remain stable.
    elements: Vec<Option<Element>>,
    #[serde(skip)]
    by_name: FxHashMap<String, ElementId>,
}

impl Dimension {
    pub fn new(id: DimensionId, name: impl Into<String>) -> Self {
        Dimension {
            id,
            name: name.into(),
            elements: Vec::new(),
            by_name: FxHashMap::default(),
        }
    }

    // ========================================================================
    // EDITING
    // ========================================================================

    /// Adds an element and returns its identifier. Names are unique.
    pub fn add_element(&mut self, name: impl Into<String>, element_type: ElementType) -> Result<ElementId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(EngineError::InvalidCoordinates(format!(
                "element '{}' already exists in dimension '{}'",
                name, self.name
            )));
        }
        let id = self.elements.len() as ElementId;
        self.by_name.insert(name.clone(), id);
        self.elements.push(Some(Element {
            id,
            name,
            element_type,
            children: Vec::new(),
            parents: Vec::new(),
            level: 0,
            depth: 0,
        }));
        Ok(id)
    }

    /// Appends a weighted child to a consolidated element.
    /// Fails if the edge would create a cycle.
    pub fn add_child(&mut self, parent: ElementId, child: ElementId, weight: f64) -> Result<()> {
        self.lookup_element(child)?;
        let parent_elem = self.lookup_element(parent)?;
        if parent_elem.element_type != ElementType::Consolidated {
            return Err(EngineError::ElementTypeMismatch(format!(
                "element '{}' is not consolidated",
                parent_elem.name
            )));
        }
        if parent == child || self.descendants(child)?.contains(&parent) {
            return Err(EngineError::InvalidCoordinates(format!(
                "adding {} below {} creates a cycle in '{}'",
                child, parent, self.name
            )));
        }
        if let Some(Some(elem)) = self.elements.get_mut(parent as usize) {
            elem.children.push((child, weight));
        }
        self.rebuild();
        Ok(())
    }

    /// Removes an element and every edge that references it.
    pub fn remove_element(&mut self, id: ElementId) -> Result<()> {
        let name = self.lookup_element(id)?.name.clone();
        self.by_name.remove(&name);
        self.elements[id as usize] = None;
        for elem in self.elements.iter_mut().flatten() {
            elem.children.retain(|(c, _)| *c != id);
        }
        self.rebuild();
        Ok(())
    }

    /// Recomputes parents, levels and depths from the children lists.
    pub fn rebuild(&mut self) {
        let mut parents: FxHashMap<ElementId, Vec<ElementId>> = FxHashMap::default();
        for elem in self.elements.iter().flatten() {
            for (child, _) in &elem.children {
                parents.entry(*child).or_default().push(elem.id);
            }
        }

        let mut levels: FxHashMap<ElementId, u32> = FxHashMap::default();
        for elem in self.elements.iter().flatten() {
            self.compute_level(elem.id, &mut levels);
        }

        let mut depths: FxHashMap<ElementId, u32> = FxHashMap::default();
        let mut queue: Vec<(ElementId, u32)> = self
            .elements
            .iter()
            .flatten()
            .filter(|e| !parents.contains_key(&e.id))
            .map(|e| (e.id, 0))
            .collect();
        while let Some((id, depth)) = queue.pop() {
            let known = depths.get(&id).copied();
            if known.map_or(false, |d| d <= depth) {
                continue;
            }
            depths.insert(id, depth);
            if let Some(Some(elem)) = self.elements.get(id as usize) {
                for (child, _) in &elem.children {
                    queue.push((*child, depth + 1));
                }
            }
        }

        let rebuilt: Vec<Option<Element>> = self
            .elements
            .iter()
            .map(|slot| {
                slot.as_ref().map(|elem| Element {
                    parents: parents.get(&elem.id).cloned().unwrap_or_default(),
                    level: levels.get(&elem.id).copied().unwrap_or(0),
                    depth: depths.get(&elem.id).copied().unwrap_or(0),
                    ..elem.clone()
                })
            })
            .collect();
        self.elements = rebuilt;
        self.by_name = self
            .elements
            .iter()
            .flatten()
            .map(|e| (e.name.clone(), e.id))
            .collect();
    }

    fn compute_level(&self, id: ElementId, levels: &mut FxHashMap<ElementId, u32>) -> u32 {
        if let Some(level) = levels.get(&id) {
            return *level;
        }
        let level = match self.elements.get(id as usize) {
            Some(Some(elem)) if !elem.children.is_empty() => elem
                .children
                .iter()
                .map(|(c, _)| self.compute_level(*c, levels) + 1)
                .max()
                .unwrap_or(0),
            _ => 0,
        };
        levels.insert(id, level);
        level
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    pub fn lookup_element(&self, id: ElementId) -> Result<&Element> {
        match self.elements.get(id as usize) {
            Some(Some(elem)) => Ok(elem),
            _ => Err(EngineError::ElementNotFound {
                dimension: self.name.clone(),
                element: id,
            }),
        }
    }

    pub fn find_element_by_name(&self, name: &str) -> Result<&Element> {
        let id = self.by_name.get(name).copied().ok_or_else(|| {
            EngineError::InvalidCoordinates(format!("element '{}' not found in '{}'", name, self.name))
        })?;
        self.lookup_element(id)
    }

    pub fn element_type(&self, id: ElementId) -> Result<ElementType> {
        Ok(self.lookup_element(id)?.element_type)
    }

    pub fn is_consolidated(&self, id: ElementId) -> bool {
        matches!(self.element_type(id), Ok(ElementType::Consolidated))
    }

    pub fn element_count(&self) -> usize {
        self.by_name.len()
    }

    /// All element identifiers in arena order.
    pub fn element_ids(&self) -> Vec<ElementId> {
        self.elements.iter().flatten().map(|e| e.id).collect()
    }

    /// All base (numeric or string) element identifiers.
    pub fn base_element_ids(&self) -> Vec<ElementId> {
        self.elements
            .iter()
            .flatten()
            .filter(|e| !e.is_consolidated())
            .map(|e| e.id)
            .collect()
    }

    pub fn children(&self, id: ElementId) -> Result<&[(ElementId, f64)]> {
        Ok(&self.lookup_element(id)?.children)
    }

    pub fn parents(&self, id: ElementId) -> Result<&[ElementId]> {
        Ok(&self.lookup_element(id)?.parents)
    }

    /// Base descendants with their accumulated weight (product of weights along
    /// each path, summed over paths). A base element maps to itself with weight 1.
    pub fn base_elements(&self, id: ElementId) -> Result<BTreeMap<ElementId, f64>> {
        let mut out = BTreeMap::new();
        self.collect_base(id, 1.0, &mut out)?;
        Ok(out)
    }

    fn collect_base(&self, id: ElementId, weight: f64, out: &mut BTreeMap<ElementId, f64>) -> Result<()> {
        let elem = self.lookup_element(id)?;
        if !elem.is_consolidated() {
            *out.entry(id).or_insert(0.0) += weight;
            return Ok(());
        }
        for (child, w) in &elem.children {
            self.collect_base(*child, weight * w, out)?;
        }
        Ok(())
    }

    pub fn descendants(&self, id: ElementId) -> Result<FxHashSet<ElementId>> {
        let mut out = FxHashSet::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for (child, _) in self.children(current)? {
                if out.insert(*child) {
                    stack.push(*child);
                }
            }
        }
        Ok(out)
    }

    pub fn ancestors(&self, id: ElementId) -> Result<FxHashSet<ElementId>> {
        let mut out = FxHashSet::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for parent in self.parents(current)? {
                if out.insert(*parent) {
                    stack.push(*parent);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> (Dimension, ElementId, ElementId, ElementId) {
        let mut dim = Dimension::new(0, "Product");
        let p1 = dim.add_element("P1", ElementType::Numeric).unwrap();
        let p2 = dim.add_element("P2", ElementType::Numeric).unwrap();
        let all = dim.add_element("AllProducts", ElementType::Consolidated).unwrap();
        dim.add_child(all, p1, 1.0).unwrap();
        dim.add_child(all, p2, 1.0).unwrap();
        (dim, p1, p2, all)
    }

    #[test]
    fn test_rebuild_parents_and_levels() {
        let (dim, p1, _, all) = products();
        assert_eq!(dim.parents(p1).unwrap(), &[all]);
        assert_eq!(dim.lookup_element(all).unwrap().level, 1);
        assert_eq!(dim.lookup_element(p1).unwrap().depth, 1);
    }

    #[test]
    fn test_base_elements_multiply_weights() {
        let (mut dim, p1, p2, all) = products();
        let top = dim.add_element("Top", ElementType::Consolidated).unwrap();
        dim.add_child(top, all, 2.0).unwrap();
        dim.add_child(top, p1, -1.0).unwrap();
        let base = dim.base_elements(top).unwrap();
        assert_eq!(base[&p1], 1.0);
        assert_eq!(base[&p2], 2.0);
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut dim, _, _, all) = products();
        let top = dim.add_element("Top", ElementType::Consolidated).unwrap();
        dim.add_child(top, all, 1.0).unwrap();
        assert!(dim.add_child(all, top, 1.0).is_err());
    }

    #[test]
    fn test_remove_element_drops_edges() {
        let (mut dim, p1, p2, all) = products();
        dim.remove_element(p1).unwrap();
        assert_eq!(dim.children(all).unwrap(), &[(p2, 1.0)]);
        assert!(dim.lookup_element(p1).is_err());
        assert_eq!(dim.element_count(), 2);
    }

    #[test]
    fn test_ancestors_and_names() {
        let (dim, p1, _, all) = products();
        assert!(dim.ancestors(p1).unwrap().contains(&all));
        assert_eq!(dim.find_element_by_name("P2").unwrap().name, "P2");
        assert!(dim.find_element_by_name("P9").is_err());
    }
}
