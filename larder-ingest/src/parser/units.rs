//! Measurement unit vocabulary shared by the grammar and the heuristic

/// (alias, canonical)
const UNIT_ALIASES: &[(&str, &str)] = &[
    ("cup", "cup"),
    ("cups", "cup"),
    ("c", "cup"),
    ("tablespoon", "tablespoon"),
    ("tablespoons", "tablespoon"),
    ("tbsp", "tablespoon"),
    ("tbsps", "tablespoon"),
    ("tbs", "tablespoon"),
    ("teaspoon", "teaspoon"),
    ("teaspoons", "teaspoon"),
    ("tsp", "teaspoon"),
    ("tsps", "teaspoon"),
    ("ounce", "ounce"),
    ("ounces", "ounce"),
    ("oz", "ounce"),
    ("fl oz", "fluid ounce"),
    ("fluid ounce", "fluid ounce"),
    ("fluid ounces", "fluid ounce"),
    ("pound", "pound"),
    ("pounds", "pound"),
    ("lb", "pound"),
    ("lbs", "pound"),
    ("gram", "gram"),
    ("grams", "gram"),
    ("g", "gram"),
    ("kilogram", "kilogram"),
    ("kilograms", "kilogram"),
    ("kg", "kilogram"),
    ("milliliter", "milliliter"),
    ("milliliters", "milliliter"),
    ("millilitre", "milliliter"),
    ("millilitres", "milliliter"),
    ("ml", "milliliter"),
    ("liter", "liter"),
    ("liters", "liter"),
    ("litre", "liter"),
    ("litres", "liter"),
    ("l", "liter"),
    ("pint", "pint"),
    ("pints", "pint"),
    ("pt", "pint"),
    ("quart", "quart"),
    ("quarts", "quart"),
    ("qt", "quart"),
    ("gallon", "gallon"),
    ("gallons", "gallon"),
    ("gal", "gallon"),
    ("pinch", "pinch"),
    ("pinches", "pinch"),
    ("dash", "dash"),
    ("dashes", "dash"),
    ("clove", "clove"),
    ("cloves", "clove"),
    ("can", "can"),
    ("cans", "can"),
    ("package", "package"),
    ("packages", "package"),
    ("pkg", "package"),
    ("slice", "slice"),
    ("slices", "slice"),
    ("stick", "stick"),
    ("sticks", "stick"),
    ("bunch", "bunch"),
    ("bunches", "bunch"),
    ("sprig", "sprig"),
    ("sprigs", "sprig"),
];

/// Canonical unit for a word or two-word phrase, ignoring case and a trailing period
pub fn canonical_unit(word: &str) -> Option<&'static str> {
    let word = word.trim().trim_end_matches('.').to_lowercase();
    UNIT_ALIASES
        .iter()
        .find(|(alias, _)| *alias == word)
        .map(|(_, canonical)| *canonical)
}

/// Vulgar fraction characters accepted as amounts
pub const FRACTION_CHARS: &[char] = &['½', '⅓', '⅔', '¼', '¾', '⅛', '⅜', '⅝', '⅞'];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_resolve_to_canonical() {
        assert_eq!(canonical_unit("Tbsp."), Some("tablespoon"));
        assert_eq!(canonical_unit("cups"), Some("cup"));
        assert_eq!(canonical_unit("fl oz"), Some("fluid ounce"));
        assert_eq!(canonical_unit("flour"), None);
    }
}
