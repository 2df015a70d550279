pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use itertools::{iproduct, izip, Itertools as _};
pub use log::warn;
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tch::{nn, Device, IndexOp, Kind, Reduction, Tensor};
pub use tch_tensor_like::TensorLike;
