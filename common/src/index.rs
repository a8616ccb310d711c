//! Índice de similitud. El merge sólo depende del trait `VectorIndex`; la
//! implementación incluida es una búsqueda exacta L2 por fuerza bruta.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Fila dentro de la matriz indexada
    pub id: usize,
    /// Distancia L2 al cuadrado
    pub distance: f32,
}

pub trait VectorIndex {
    fn dim(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn add(&mut self, vectors: ArrayView2<'_, f32>) -> Result<()>;
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatL2Index {
    dim: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let index: FlatL2Index = bincode::deserialize_from(reader)?;
        if index.dim == 0 || index.data.len() % index.dim != 0 {
            return Err(DispatchError::Serialization(format!(
                "índice corrupto en {}",
                path.display()
            )));
        }
        Ok(index)
    }
}

impl VectorIndex for FlatL2Index {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    fn add(&mut self, vectors: ArrayView2<'_, f32>) -> Result<()> {
        if vectors.ncols() != self.dim {
            return Err(DispatchError::InvalidArgument(format!(
                "vectores de dimensión {} en un índice de dimensión {}",
                vectors.ncols(),
                self.dim
            )));
        }
        self.data.reserve(vectors.len());
        for row in vectors.rows() {
            self.data.extend(row.iter().copied());
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dim {
            return Err(DispatchError::InvalidArgument(format!(
                "consulta de dimensión {}, el índice tiene {}",
                query.len(),
                self.dim
            )));
        }
        let mut hits: Vec<Neighbor> = (0..self.len())
            .map(|id| Neighbor {
                id,
                distance: self
                    .row(id)
                    .iter()
                    .zip(query)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum(),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }
}
