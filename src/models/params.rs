//! Role-tagged parameter registry shared by every model component.
//!
//! Each entry carries a [`ParamRole`] assigned when the component is built or
//! loaded, so trainability is decided by structural role instead of by
//! matching parameter names.

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::{Init, VarBuilder};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamRole {
    TokenEmbedding,
    PositionEmbedding,
    TextEncoderBody,
    ImageCodec,
    CrossAttnQuery,
    CrossAttnKey,
    CrossAttnValue,
    CrossAttnOut,
    BackboneBody,
}

#[derive(Clone)]
pub enum ParamValue {
    Frozen(Tensor),
    Trainable(Var),
}

#[derive(Clone)]
pub struct Param {
    role: ParamRole,
    value: ParamValue,
}

impl Param {
    pub fn tensor(&self) -> &Tensor {
        match &self.value {
            ParamValue::Frozen(t) => t,
            ParamValue::Trainable(v) => v.as_tensor(),
        }
    }

    pub fn var(&self) -> Option<&Var> {
        match &self.value {
            ParamValue::Trainable(v) => Some(v),
            ParamValue::Frozen(_) => None,
        }
    }

    pub fn is_trainable(&self) -> bool {
        self.var().is_some()
    }
}

/// Named parameters of one component, ordered by key.
#[derive(Clone, Default)]
pub struct ParamStore {
    entries: BTreeMap<String, Param>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every tensor of a safetensors file, tagging each key with `classify`.
    pub fn from_safetensors(
        path: &Path,
        device: &Device,
        classify: impl Fn(&str) -> ParamRole,
    ) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load weights: {}", path.display()))?;
        let mut store = Self::new();
        for (name, tensor) in tensors {
            let role = classify(&name);
            store.insert(name, role, tensor);
        }
        Ok(store)
    }

    /// Insert a frozen entry, replacing any previous entry of the same name.
    pub fn insert(&mut self, name: impl Into<String>, role: ParamRole, tensor: Tensor) {
        self.entries.insert(
            name.into(),
            Param {
                role,
                value: ParamValue::Frozen(tensor),
            },
        );
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.entries.get(name)
    }

    pub fn get(&self, name: &str) -> Result<Tensor> {
        self.entries
            .get(name)
            .map(|p| p.tensor().clone())
            .ok_or_else(|| anyhow!("parameter not found: {}", name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.entries.iter().map(|(k, p)| (k.as_str(), p))
    }

    /// Storage dtype of the first floating-point entry tagged `role`.
    pub fn dtype_of(&self, role: ParamRole) -> Option<DType> {
        self.entries
            .values()
            .filter(|p| p.role == role)
            .map(|p| p.tensor().dtype())
            .find(|d| d.is_float())
    }

    pub fn keys_with_role(&self, role: ParamRole) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, p)| p.role == role)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Key of the single entry carrying `role`.
    pub fn unique_key(&self, role: ParamRole) -> Result<String> {
        let keys = self.keys_with_role(role);
        match keys.as_slice() {
            [key] => Ok(key.clone()),
            [] => bail!("no parameter tagged {:?}", role),
            _ => bail!("{} parameters tagged {:?}, expected one", keys.len(), role),
        }
    }

    /// Overwrite an entry's value, keeping its role.
    ///
    /// A trainable entry of unchanged shape is updated in place so modules
    /// holding its tensor observe the new value; otherwise the entry is
    /// rebuilt with the same trainability.
    pub fn replace(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        let param = self
            .entries
            .get_mut(name)
            .ok_or_else(|| anyhow!("parameter not found: {}", name))?;
        param.value = match &param.value {
            ParamValue::Trainable(var) if var.shape() == tensor.shape() => {
                var.set(&tensor.to_dtype(var.dtype())?)?;
                return Ok(());
            }
            ParamValue::Trainable(var) => {
                ParamValue::Trainable(Var::from_tensor(&tensor.to_dtype(var.dtype())?)?)
            }
            ParamValue::Frozen(old) => ParamValue::Frozen(tensor.to_dtype(old.dtype())?),
        };
        Ok(())
    }

    /// Turn an entry into a full-precision trainable variable.
    pub fn make_trainable(&mut self, name: &str) -> Result<Var> {
        let param = self
            .entries
            .get_mut(name)
            .ok_or_else(|| anyhow!("parameter not found: {}", name))?;
        if let ParamValue::Trainable(var) = &param.value {
            if var.dtype() == DType::F32 {
                return Ok(var.clone());
            }
        }
        let var = Var::from_tensor(&param.tensor().to_dtype(DType::F32)?)?;
        param.value = ParamValue::Trainable(var.clone());
        Ok(var)
    }

    /// Turn an entry into a detached tensor stored as `dtype`.
    pub fn freeze(&mut self, name: &str, dtype: DType) -> Result<()> {
        let param = self
            .entries
            .get_mut(name)
            .ok_or_else(|| anyhow!("parameter not found: {}", name))?;
        let frozen = param.tensor().detach().to_dtype(dtype)?;
        param.value = ParamValue::Frozen(frozen);
        Ok(())
    }

    pub fn trainable(&self) -> Vec<(String, Var)> {
        self.entries
            .iter()
            .filter_map(|(k, p)| p.var().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Copy of the entries restricted to `keys`, detached and stored as `dtype`.
    pub fn snapshot(&self, keys: &[String], dtype: DType) -> Result<Self> {
        let mut out = Self::new();
        for key in keys {
            let param = self
                .entries
                .get(key)
                .ok_or_else(|| anyhow!("parameter not found: {}", key))?;
            // copy() so later in-place updates of a trainable var never leak in
            let tensor = param.tensor().detach().copy()?.to_dtype(dtype)?;
            out.insert(key.clone(), param.role, tensor);
        }
        Ok(out)
    }

    /// VarBuilder reading from this store, for modules built from named weights.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        let tensors = self
            .entries
            .iter()
            .map(|(k, p)| (k.clone(), (p.role, p.tensor().clone())))
            .collect();
        VarBuilder::from_backend(Box::new(StoreBackend { tensors }), dtype, device.clone())
    }
}

/// VarBuilder backend over a [`ParamStore`] snapshot.
///
/// Tensors are handed out as stored, so trainable variables stay linked to
/// the modules built from them. The token-embedding table may hold more rows
/// than the architecture declares (added vocabulary).
struct StoreBackend {
    tensors: HashMap<String, (ParamRole, Tensor)>,
}

impl candle_nn::var_builder::SimpleBackend for StoreBackend {
    fn get(
        &self,
        s: Shape,
        name: &str,
        _h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        let (role, tensor) = self
            .tensors
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("cannot find tensor at path: {}", name)))?;

        let expected = s.dims();
        let got = tensor.dims();
        let grown_vocab = *role == ParamRole::TokenEmbedding
            && expected.len() == 2
            && got.len() == 2
            && got[1] == expected[1]
            && got[0] >= expected[0];
        if got != expected && !grown_vocab {
            return Err(candle_core::Error::Msg(format!(
                "shape mismatch for {}: expected {:?}, got {:?}",
                name, expected, got
            )));
        }

        tensor.to_device(dev)?.to_dtype(dtype)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ParamStore {
        let dev = Device::Cpu;
        let mut s = ParamStore::new();
        s.insert(
            "emb.weight",
            ParamRole::TokenEmbedding,
            Tensor::arange(0f32, 6., &dev).unwrap().reshape((3, 2)).unwrap(),
        );
        s.insert(
            "attn2.to_k.weight",
            ParamRole::CrossAttnKey,
            Tensor::ones((2, 2), DType::F16, &dev).unwrap(),
        );
        s
    }

    #[test]
    fn test_make_trainable_promotes_to_f32() {
        let mut s = store();
        let var = s.make_trainable("attn2.to_k.weight").unwrap();
        assert_eq!(var.dtype(), DType::F32);
        assert!(s.param("attn2.to_k.weight").unwrap().is_trainable());
        assert_eq!(s.trainable().len(), 1);
    }

    #[test]
    fn test_freeze_detaches_and_casts() {
        let mut s = store();
        s.make_trainable("emb.weight").unwrap();
        s.freeze("emb.weight", DType::F16).unwrap();
        let p = s.param("emb.weight").unwrap();
        assert!(!p.is_trainable());
        assert_eq!(p.tensor().dtype(), DType::F16);
    }

    #[test]
    fn test_replace_updates_var_in_place() {
        let mut s = store();
        let var = s.make_trainable("emb.weight").unwrap();
        let held = var.as_tensor().clone();
        s.replace("emb.weight", Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let sum: f32 = held.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_snapshot_is_independent_of_training() {
        let mut s = store();
        let var = s.make_trainable("emb.weight").unwrap();
        let snap = s.snapshot(&["emb.weight".to_string()], DType::F32).unwrap();
        var.set(&Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap()).unwrap();
        let sum: f32 = snap.get("emb.weight").unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 15.0);
    }

    #[test]
    fn test_keys_by_role() {
        let s = store();
        assert_eq!(s.keys_with_role(ParamRole::CrossAttnKey), vec!["attn2.to_k.weight"]);
        assert_eq!(s.unique_key(ParamRole::TokenEmbedding).unwrap(), "emb.weight");
        assert!(s.unique_key(ParamRole::CrossAttnQuery).is_err());
    }

    #[test]
    fn test_var_builder_accepts_grown_vocab_only() {
        let s = store();
        let vb = s.var_builder(DType::F32, &Device::Cpu);
        assert!(vb.get((2, 2), "emb.weight").is_ok());
        assert!(vb.get((4, 2), "emb.weight").is_err());
        assert!(vb.get((2, 3), "attn2.to_k.weight").is_err());
    }
}
