use crate::io::StateDict;

type TransformationBox = Box<dyn Fn(&mut StateDict)>;

/// Builder for composable state dict transformations
///
/// `StateDictMapper` rewrites checkpoints whose key layout differs from the
/// module tree that will load them. Transformations are applied in the order
/// they are added.
///
/// # Examples
///
/// ```
/// use clip_tower::io::mapping::StateDictMapper;
/// use clip_tower::io::StateDict;
///
/// let mapper = StateDictMapper::new()
///     .exclude_keys(["context_length", "vocab_size"])
///     .add_prefix_where("text.", |k| k.starts_with("token_embedding"));
/// let state = mapper.map(StateDict::new());
/// assert!(state.is_empty());
/// ```
pub struct StateDictMapper {
    transformations: Vec<TransformationBox>,
}

impl StateDictMapper {
    /// Create a new empty mapper
    #[must_use]
    pub fn new() -> Self {
        Self {
            transformations: Vec::new(),
        }
    }

    /// Prefix every key accepted by `pred`
    ///
    /// Example: `add_prefix_where("text.", |k| !k.starts_with("visual."))`
    #[must_use]
    pub fn add_prefix_where<F>(mut self, prefix: impl Into<String>, pred: F) -> Self
    where
        F: Fn(&str) -> bool + 'static,
    {
        let prefix = prefix.into();

        self.transformations
            .push(Box::new(move |state: &mut StateDict| {
                let keys: Vec<String> = state.keys().filter(|k| pred(k)).cloned().collect();
                for key in keys {
                    if let Some(value) = state.remove(&key) {
                        state.insert(format!("{prefix}{key}"), value);
                    }
                }
            }));
        self
    }

    /// Exclude specific keys
    ///
    /// The specified keys are removed from the state dict.
    #[must_use]
    pub fn exclude_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.transformations
            .push(Box::new(move |state: &mut StateDict| {
                state.retain(|k, _| !keys.contains(k));
            }));
        self
    }

    /// Apply all transformations to a state dict (in-place)
    pub fn apply(&self, state: &mut StateDict) {
        for transform in &self.transformations {
            transform(state);
        }
    }

    /// Apply transformations and return new state dict
    #[must_use]
    pub fn map(&self, mut state: StateDict) -> StateDict {
        self.apply(&mut state);
        state
    }
}

impl Default for StateDictMapper {
    fn default() -> Self {
        Self::new()
    }
}
