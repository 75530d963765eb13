use crate::Registry;

pub(crate) const APEX_PATH: &str = "src/fixtures/apex.tmLanguage.yaml";
pub(crate) const SOQL_PATH: &str = "src/fixtures/soql.tmLanguage.json";

/// Apex and SOQL, SOQL being allowed to use Apex rules
pub(crate) fn get_registry() -> Registry {
    let mut registry = Registry::default();
    registry.add_grammar_from_path(APEX_PATH).unwrap();
    registry.add_grammar_from_path(SOQL_PATH).unwrap();
    registry.allow_include("source.soql", "Apex");
    registry.link_grammars().unwrap();
    registry
}
