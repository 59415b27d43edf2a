//! Optimizer parameter grouping

use crate::{Module, Parameter};

/// Name fragments of parameters that are trained without weight decay
pub const DEFAULT_NO_DECAY_NAME_LIST: [&str; 2] = ["bias", "LayerNorm.weight"];

/// Parameters sharing one weight-decay coefficient
#[derive(Debug)]
pub struct ParamGroup<'a> {
    pub params: Vec<(&'a str, &'a Parameter)>,
    pub weight_decay: f64,
}

impl ParamGroup<'_> {
    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Split trainable parameters into `[decay, no_decay]` groups
///
/// A parameter goes to the no-decay group when its name contains any entry
/// of `no_decay_name_list`. Frozen parameters are left out of both.
pub fn get_optimizer_grouped_parameters<'a, S: AsRef<str>>(
    module: &'a dyn Module,
    weight_decay: f64,
    no_decay_name_list: &[S],
) -> [ParamGroup<'a>; 2] {
    let (no_decay, decay): (Vec<_>, Vec<_>) = module
        .named_parameters()
        .into_iter()
        .filter(|(_, p)| p.requires_grad)
        .partition(|(name, _)| {
            no_decay_name_list
                .iter()
                .any(|nd| name.contains(nd.as_ref()))
        });

    [
        ParamGroup {
            params: decay,
            weight_decay,
        },
        ParamGroup {
            params: no_decay,
            weight_decay: 0.0,
        },
    ]
}
