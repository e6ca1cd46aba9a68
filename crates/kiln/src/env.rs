//! Build-context environment injection.
//!
//! The recipe/product configuration layer sits outside this crate; its
//! contract with the containers is the `CURRENT_*` environment variable
//! set injected into every command run in an SDK session. [`BuildContext`]
//! models that boundary.

use std::collections::BTreeMap;

/// Instrumentation level of a build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum InstrumentationLevel {
    /// No instrumentation; release-grade artifacts.
    #[default]
    Production,
    /// Development instrumentation enabled.
    Development,
    /// Full debug instrumentation.
    Debug,
}

impl InstrumentationLevel {
    /// Numeric value exported to the build environment.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Production => 0,
            Self::Development => 1,
            Self::Debug => 2,
        }
    }
}

/// Identity of the build target a session works on, plus the SDK image
/// providing the execution environment. Values come from the out-of-scope
/// recipe/product layer.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Name of the product being built.
    pub product: String,
    /// Product version.
    pub product_version: String,
    /// Version tainted with a build flag when any instrumentation feature
    /// is active; absent otherwise.
    pub tainted_version: Option<String>,
    /// Name of the recipe being processed.
    pub recipe: String,
    /// Instrumentation level of the recipe.
    pub instrumentation_level: InstrumentationLevel,
    /// Name of the action being performed (`build`, `image`, ...).
    pub action: String,
    /// Product properties, in declaration order. The order drives the
    /// numbering of the exported property variables.
    pub properties: Vec<(String, String)>,
    /// Product providing the SDK image.
    pub sdk_product: String,
    /// Recipe providing the SDK image.
    pub sdk_recipe: String,
}

impl BuildContext {
    /// The `CURRENT_*` environment variable set for this context.
    #[must_use]
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("CURRENT_PRODUCT".to_owned(), self.product.clone()),
            (
                "CURRENT_PRODUCT_VERSION".to_owned(),
                self.product_version.clone(),
            ),
            (
                "CURRENT_PRODUCT_TAINTED_VERSION".to_owned(),
                self.tainted_version
                    .clone()
                    .unwrap_or_else(|| self.product_version.clone()),
            ),
            ("CURRENT_RECIPE".to_owned(), self.recipe.clone()),
            (
                "CURRENT_RECIPE_INSTRUMENTATION_LEVEL".to_owned(),
                self.instrumentation_level.value().to_string(),
            ),
            ("CURRENT_ACTION".to_owned(), self.action.clone()),
            ("CURRENT_SDK_PRODUCT".to_owned(), self.sdk_product.clone()),
            ("CURRENT_SDK_RECIPE".to_owned(), self.sdk_recipe.clone()),
        ]);
        let mut property_names = Vec::with_capacity(self.properties.len());
        for (index, (name, value)) in self.properties.iter().enumerate() {
            property_names.push(name.clone());
            let _ = env.insert(format!("CURRENT_PRODUCT_PROPERTY_{index}"), value.clone());
        }
        let _ = env.insert(
            "CURRENT_PRODUCT_PROPERTIES".to_owned(),
            property_names.join(" "),
        );
        env
    }
}

/// Compose the environment for an SDK session: the SDK's base variables,
/// then caller overrides, then the build context (which always wins).
#[must_use]
pub fn session_env(
    base: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
    context: &BuildContext,
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    env.extend(overrides.clone());
    env.extend(context.to_env());
    env
}
