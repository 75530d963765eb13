/// Knobs for loading and linking grammars.
///
/// ```
/// use tintex::LoadOptions;
///
/// let options = LoadOptions::default().max_include_depth(20);
/// assert_eq!(options.get_max_include_depth(), 20);
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LoadOptions {
    /// How many includes can be followed in a row before reaching a rule that consumes text.
    /// Recursive includes without such a rule always hit that limit.
    pub(crate) max_include_depth: usize,
    /// Compile every regex when loading so a broken pattern is reported right away
    pub(crate) validate_regexes: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_include_depth: 50,
            validate_regexes: true,
        }
    }
}

impl LoadOptions {
    pub fn max_include_depth(mut self, depth: usize) -> Self {
        self.max_include_depth = depth;
        self
    }

    /// Skipping validation makes loading faster, invalid regexes then never match
    pub fn validate_regexes(mut self, validate: bool) -> Self {
        self.validate_regexes = validate;
        self
    }

    pub fn get_max_include_depth(&self) -> usize {
        self.max_include_depth
    }
}
