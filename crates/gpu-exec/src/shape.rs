use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Bytes occupied by one element of a tuple index table on device.
pub const POINTER_SIZE: u64 = 8;

/// Scalar element types a device buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
}

impl PrimitiveType {
    pub fn byte_width(self) -> u64 {
        match self {
            PrimitiveType::Pred | PrimitiveType::S8 | PrimitiveType::U8 => 1,
            PrimitiveType::S16 | PrimitiveType::U16 | PrimitiveType::F16 | PrimitiveType::Bf16 => 2,
            PrimitiveType::S32 | PrimitiveType::U32 | PrimitiveType::F32 => 4,
            PrimitiveType::S64 | PrimitiveType::U64 | PrimitiveType::F64 => 8,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PrimitiveType::Pred => "pred",
            PrimitiveType::S8 => "s8",
            PrimitiveType::S16 => "s16",
            PrimitiveType::S32 => "s32",
            PrimitiveType::S64 => "s64",
            PrimitiveType::U8 => "u8",
            PrimitiveType::U16 => "u16",
            PrimitiveType::U32 => "u32",
            PrimitiveType::U64 => "u64",
            PrimitiveType::F16 => "f16",
            PrimitiveType::Bf16 => "bf16",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
        }
    }
}

/// Device shape: a dense array or a tuple of shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Array {
        element_type: PrimitiveType,
        dims: Vec<u64>,
    },
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(element_type: PrimitiveType, dims: &[u64]) -> Self {
        Shape::Array {
            element_type,
            dims: dims.to_vec(),
        }
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    pub fn tuple_elements(&self) -> &[Shape] {
        match self {
            Shape::Tuple(elements) => elements,
            Shape::Array { .. } => &[],
        }
    }

    /// Size of the on-device representation. Tuples hold one pointer per element.
    pub fn byte_size(&self) -> u64 {
        match self {
            Shape::Array { element_type, dims } => {
                dims.iter().product::<u64>() * element_type.byte_width()
            }
            Shape::Tuple(elements) => POINTER_SIZE * elements.len() as u64,
        }
    }

    pub fn subshape(&self, index: &ShapeIndex) -> Option<&Shape> {
        let mut current = self;
        for &i in index.as_slice() {
            current = current.tuple_elements().get(i)?;
        }
        Some(current)
    }

    /// Every index of the shape in pre-order, root first.
    pub fn indices(&self) -> Vec<ShapeIndex> {
        let mut out = Vec::new();
        let mut prefix = ShapeIndex::root();
        collect_indices(self, &mut prefix, &mut out);
        out
    }

    pub fn leaf_indices(&self) -> Vec<ShapeIndex> {
        self.indices()
            .into_iter()
            .filter(|index| {
                self.subshape(index)
                    .map(|sub| !sub.is_tuple())
                    .unwrap_or(false)
            })
            .collect()
    }
}

fn collect_indices(shape: &Shape, prefix: &mut ShapeIndex, out: &mut Vec<ShapeIndex>) {
    out.push(prefix.clone());
    for (i, element) in shape.tuple_elements().iter().enumerate() {
        prefix.push(i);
        collect_indices(element, prefix, out);
        prefix.pop();
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array { element_type, dims } => {
                write!(f, "{}[", element_type.name())?;
                for (i, dim) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{dim}")?;
                }
                write!(f, "]")
            }
            Shape::Tuple(elements) => {
                write!(f, "(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Path from the root of a shape to one of its subshapes.
///
/// Ordering is lexicographic, so sorting indices yields pre-order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShapeIndex(SmallVec<[usize; 4]>);

impl ShapeIndex {
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, i: usize) {
        self.0.push(i);
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.0.pop()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl From<&[usize]> for ShapeIndex {
    fn from(value: &[usize]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl From<Vec<usize>> for ShapeIndex {
    fn from(value: Vec<usize>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl<const N: usize> From<[usize; N]> for ShapeIndex {
    fn from(value: [usize; N]) -> Self {
        Self(value.iter().copied().collect())
    }
}

impl fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "}}")
    }
}

/// One value per index of a shape, iterated in pre-order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeTree<T> {
    shape: Shape,
    nodes: BTreeMap<ShapeIndex, T>,
}

impl<T> ShapeTree<T> {
    pub fn from_fn(shape: Shape, mut f: impl FnMut(&ShapeIndex) -> T) -> Self {
        let nodes = shape
            .indices()
            .into_iter()
            .map(|index| {
                let value = f(&index);
                (index, value)
            })
            .collect();
        Self { shape, nodes }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn element(&self, index: &ShapeIndex) -> Option<&T> {
        self.nodes.get(index)
    }

    pub fn element_mut(&mut self, index: &ShapeIndex) -> Option<&mut T> {
        self.nodes.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShapeIndex, &T)> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ShapeIndex, &mut T)> {
        self.nodes.iter_mut()
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&ShapeIndex, &T)> {
        let shape = &self.shape;
        self.nodes.iter().filter(move |(index, _)| {
            shape
                .subshape(index)
                .map(|sub| !sub.is_tuple())
                .unwrap_or(false)
        })
    }

    pub fn map<U>(self, mut f: impl FnMut(&ShapeIndex, T) -> U) -> ShapeTree<U> {
        let nodes = self
            .nodes
            .into_iter()
            .map(|(index, value)| {
                let mapped = f(&index, value);
                (index, mapped)
            })
            .collect();
        ShapeTree {
            shape: self.shape,
            nodes,
        }
    }

    pub fn into_parts(self) -> (Shape, BTreeMap<ShapeIndex, T>) {
        (self.shape, self.nodes)
    }
}

impl<T: Default> ShapeTree<T> {
    pub fn new(shape: Shape) -> Self {
        Self::from_fn(shape, |_| T::default())
    }
}
