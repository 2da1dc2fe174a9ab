use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

/// Codes must carry at least one channel word and two secret words.
pub const MIN_WORDS: usize = 3;

/// Fixed English dictionary used for code generation.
///
/// Short, common, phonetically distinct words so a code survives being
/// read out loud over a bad phone line.
pub const DICTIONARY: &[&str] = &[
    "acorn", "amber", "anchor", "apple", "arrow", "aspen", "atlas", "autumn",
    "badge", "bamboo", "basil", "beacon", "berry", "birch", "bison", "blaze",
    "bloom", "breeze", "brick", "bridge", "bronze", "brook", "butter", "cabin",
    "candle", "canyon", "carbon", "castle", "cedar", "chalk", "cherry", "cider",
    "cliff", "clover", "cobalt", "comet", "copper", "coral", "cotton", "cradle",
    "crane", "cricket", "crystal", "daisy", "dawn", "delta", "denim", "drift",
    "eagle", "ember", "fable", "falcon", "feather", "fern", "flint", "forest",
    "fossil", "frost", "garden", "garnet", "ginger", "glacier", "goose", "granite",
    "grape", "gravel", "grove", "harbor", "hazel", "heron", "hickory", "honey",
    "horizon", "indigo", "iris", "island", "ivory", "jade", "jasper", "juniper",
    "kettle", "lagoon", "lamp", "lantern", "laurel", "lemon", "lilac", "linen",
    "lotus", "lunar", "magnet", "mango", "maple", "marble", "meadow", "mesa",
    "mint", "mirror", "monsoon", "morning", "mossy", "mountain", "nectar", "nickel",
    "north", "nutmeg", "oasis", "ocean", "olive", "onyx", "opal", "orbit",
    "orchid", "otter", "paper", "pebble", "pecan", "pepper", "pine", "planet",
    "plume", "pond", "poplar", "prairie", "prism", "pumpkin", "quartz", "quill",
    "raven", "reef", "ridge", "river", "robin", "rustic", "saddle", "saffron",
    "salmon", "sapphire", "seed", "shadow", "shore", "silver", "sparrow", "spring",
    "spruce", "stone", "storm", "summit", "sunset", "tiger", "timber", "topaz",
    "trail", "tulip", "tundra", "valley", "velvet", "violet", "walnut", "willow",
    "winter", "wren", "zephyr", "zinc",
];

/// Errors from word sampling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WordsError {
    #[error("the number of words must not be less than {MIN_WORDS}, got {0}")]
    TooFew(usize),
}

/// Samples `count` random words from the dictionary.
///
/// Words are drawn without replacement so a code never repeats a word,
/// which keeps it easy to relay verbally.
///
/// # Errors
///
/// Returns [`WordsError::TooFew`] when `count` is below [`MIN_WORDS`].
pub fn random_words(count: usize) -> Result<Vec<String>, WordsError> {
    if count < MIN_WORDS {
        return Err(WordsError::TooFew(count));
    }
    let mut rng = rand::thread_rng();
    Ok(sample(&mut rng, count))
}

fn sample<R: Rng>(rng: &mut R, count: usize) -> Vec<String> {
    DICTIONARY
        .choose_multiple(rng, count)
        .map(|w| (*w).to_string())
        .collect()
}
