//! PyO3 bindings for the retrieval pipeline.
//!
//! Exposes `featstore.Retriever` and `featstore.field_info` via maturin.

use std::path::PathBuf;

use numpy::{PyArray1, PyArrayMethods, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use serde::de::DeserializeOwned;

use crate::config::RetrieverConfig;
use crate::error::{FeedError, FeedErrorKind};
use crate::materialize::FeatureBatch;
use crate::retriever::{self, FeatureRetriever};

fn to_py_err(err: FeedError) -> PyErr {
    match err.kind() {
        FeedErrorKind::DataLoss => PyKeyError::new_err(err.to_string()),
        FeedErrorKind::InvalidInput | FeedErrorKind::Configuration => {
            PyValueError::new_err(err.to_string())
        }
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

/// Parse a snake_case enum name the same way the JSON config does.
fn parse_option<T: DeserializeOwned>(name: &str, value: &str) -> PyResult<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| PyValueError::new_err(format!("invalid {name}: {value:?}")))
}

/// Convert a `FeatureBatch` into a Python dict of numpy arrays.
///
/// Uses `PyArray::from_vec` for zero-copy ownership transfer from Rust to NumPy.
fn batch_to_dict<'py>(py: Python<'py>, batch: FeatureBatch) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    let n = batch.num_examples;
    let m = batch.max_feats;

    // [N, max_feats]
    let feat_field_id = PyArray1::from_vec(py, batch.field_ids).reshape([n, m])?;
    dict.set_item("feat_field_id", feat_field_id)?;

    let feat_id = PyArray1::from_vec(py, batch.feat_ids).reshape([n, m])?;
    dict.set_item("feat_id", feat_id)?;

    let features = PyArray1::from_vec(py, batch.values).reshape([n, m])?;
    dict.set_item("features", features)?;

    // [N]
    dict.set_item("y", PyArray1::from_vec(py, batch.y))?;
    dict.set_item("z", PyArray1::from_vec(py, batch.z))?;
    dict.set_item("lens", PyArray1::from_vec(py, batch.lens))?;

    Ok(dict)
}

/// Python-visible Retriever class.
#[pyclass(name = "Retriever")]
struct PyRetriever {
    inner: FeatureRetriever,
}

#[pymethods]
impl PyRetriever {
    #[new]
    #[pyo3(signature = (
        examples_db,
        comm_feats_db,
        max_feats,
        vocab,
        chunk_size = 64,
        num_threads = None,
        key_byte_order = "little",
        examples_miss_policy = "fail_batch",
        comm_feats_miss_policy = "skip",
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        py: Python<'_>,
        examples_db: PathBuf,
        comm_feats_db: PathBuf,
        max_feats: usize,
        vocab: PathBuf,
        chunk_size: usize,
        num_threads: Option<usize>,
        key_byte_order: &str,
        examples_miss_policy: &str,
        comm_feats_miss_policy: &str,
    ) -> PyResult<Self> {
        let config = RetrieverConfig {
            chunk_size,
            num_threads,
            key_byte_order: parse_option("key_byte_order", key_byte_order)?,
            examples_miss_policy: parse_option("examples_miss_policy", examples_miss_policy)?,
            comm_feats_miss_policy: parse_option("comm_feats_miss_policy", comm_feats_miss_policy)?,
            ..RetrieverConfig::new(examples_db, comm_feats_db, max_feats, vocab)
        };

        let inner = py.detach(|| FeatureRetriever::open(config)).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[getter]
    fn max_feats(&self) -> usize {
        self.inner.max_feats()
    }

    /// Retrieve one batch. `example_ids` must be a 1-D int64 array.
    /// Returns a dict of numpy arrays; the GIL is released during retrieval.
    fn __call__<'py>(
        &self,
        py: Python<'py>,
        example_ids: PyReadonlyArrayDyn<'py, i64>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let ids = example_ids.as_array().to_owned();
        let batch = py
            .detach(|| self.inner.compute(ids.view()))
            .map_err(to_py_err)?;
        batch_to_dict(py, batch)
    }
}

/// Field statistics of a vocabulary file: `field_id`, `slots`, `counts`.
#[pyfunction]
fn field_info<'py>(py: Python<'py>, vocab: PathBuf) -> PyResult<Bound<'py, PyDict>> {
    let cols = py.detach(|| retriever::field_info(&vocab)).map_err(to_py_err)?;
    let dict = PyDict::new(py);
    dict.set_item("field_id", PyArray1::from_vec(py, cols.field_ids))?;
    dict.set_item("slots", PyArray1::from_vec(py, cols.slots))?;
    dict.set_item("counts", PyArray1::from_vec(py, cols.counts))?;
    Ok(dict)
}

/// Register the featstore Python module.
#[pymodule]
fn featstore(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyRetriever>()?;
    m.add_function(wrap_pyfunction!(field_info, m)?)?;
    Ok(())
}
