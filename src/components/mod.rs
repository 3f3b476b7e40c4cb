mod merger;
mod searcher;

pub use self::merger::Merger;
pub use self::searcher::Searcher;
