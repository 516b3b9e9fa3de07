use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Canvas coordinates of a placed block
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

/// Running {avg, count} over the ratings of one marketplace target
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RatingAggregate {
    pub avg: f64,
    pub count: u32,
}

impl RatingAggregate {
    /// Exact aggregate over a set of scores
    pub fn from_scores<I: IntoIterator<Item = u8>>(scores: I) -> Self {
        let (sum, count) = scores
            .into_iter()
            .fold((0u64, 0u32), |(sum, count), s| (sum + u64::from(s), count + 1));
        if count == 0 {
            return Self::default();
        }
        Self {
            avg: sum as f64 / f64::from(count),
            count,
        }
    }
}

/// One page of a larger ordered result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl<T> Page<T> {
    /// Slice `all` into the 1-based `page` of size `per_page`
    pub fn from_vec(all: Vec<T>, page: usize, per_page: usize) -> Self {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        Self {
            items,
            page,
            per_page,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_aggregate_is_exact_mean() {
        let agg = RatingAggregate::from_scores([5, 4, 4, 1]);
        assert_eq!(agg.count, 4);
        assert!((agg.avg - 3.5).abs() < f64::EPSILON);
        assert_eq!(RatingAggregate::from_scores(Vec::<u8>::new()), RatingAggregate::default());
    }

    #[test]
    fn test_page_slicing() {
        let page = Page::from_vec((1..=7).collect::<Vec<_>>(), 2, 3);
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 7);

        let past_end = Page::from_vec(vec![1, 2], 4, 10);
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.page, 4);
    }

    #[test]
    fn test_huge_page_number_is_empty() {
        let page = Page::from_vec((1..=7).collect::<Vec<_>>(), usize::MAX, 3);
        assert!(page.items.is_empty());
        assert_eq!(page.total, 7);
        assert_eq!(page.page, usize::MAX);
    }
}
