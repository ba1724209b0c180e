//! Page and ordering parameters as sent by clients, and the executor that
//! applies them to a repository.

mod executor;

pub use executor::PageExecutor;

use serde::{Deserialize, Serialize};

/// Rows per page when the client sends no usable page size.
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Client paging request.
///
/// `page_size == -1` asks for every row; `last_size > 0` overrides the
/// page size for the limit only, so the offset still follows `page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PageParams {
    pub page: u32,
    pub page_size: i32,
    pub last_size: u32,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
            last_size: 0,
        }
    }
}

impl PageParams {
    pub fn new(page: u32, page_size: i32) -> Self {
        Self {
            page,
            page_size,
            last_size: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(1, -1)
    }

    /// `None` means no limit.
    pub fn limit(&self) -> Option<usize> {
        if self.last_size > 0 {
            return Some(self.last_size as usize);
        }
        match self.page_size {
            -1 => None,
            size if size < 1 => Some(DEFAULT_PAGE_LIMIT),
            size => Some(size as usize),
        }
    }

    pub fn offset(&self) -> usize {
        let size = match self.page_size {
            -1 => return 0,
            size if size < 1 => DEFAULT_PAGE_LIMIT,
            size => size as usize,
        };
        let page = self.page.max(1) as usize;
        (page - 1) * size
    }
}

/// Sort direction as spelled by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    Asc,
    Desc,
}

impl Sort {
    /// Accepts `asc`/`ascend` and `desc`/`descend`, ignoring case.
    pub fn parse(word: &str) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascend" => Some(Self::Asc),
            "desc" | "descend" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// One requested ordering: a client-facing key and a sort word.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderParams {
    pub order_key: String,
    pub sort: String,
}

impl OrderParams {
    pub fn new(order_key: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            order_key: order_key.into(),
            sort: sort.into(),
        }
    }

    pub fn sort(&self) -> Option<Sort> {
        Sort::parse(&self.sort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_page() {
        let page = PageParams::new(3, 10);
        assert_eq!(page.limit(), Some(10));
        assert_eq!(page.offset(), 20);
    }

    #[test]
    fn page_zero_is_first_page() {
        assert_eq!(PageParams::new(0, 10).offset(), 0);
    }

    #[test]
    fn unlimited_has_no_limit_and_no_offset() {
        let page = PageParams {
            page: 4,
            ..PageParams::unlimited()
        };
        assert_eq!(page.limit(), None);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn invalid_size_falls_back_to_default() {
        let page = PageParams::new(2, 0);
        assert_eq!(page.limit(), Some(DEFAULT_PAGE_LIMIT));
        assert_eq!(page.offset(), DEFAULT_PAGE_LIMIT);
        assert_eq!(PageParams::new(1, -5).limit(), Some(DEFAULT_PAGE_LIMIT));
    }

    #[test]
    fn last_size_overrides_limit_only() {
        let page = PageParams {
            page: 3,
            page_size: 10,
            last_size: 4,
        };
        assert_eq!(page.limit(), Some(4));
        assert_eq!(page.offset(), 20);
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let page: PageParams = serde_json::from_str(r#"{"pageSize": 25}"#).expect("page");
        assert_eq!(page, PageParams::new(1, 25));

        let order: OrderParams =
            serde_json::from_str(r#"{"orderKey": "created", "sort": "descend"}"#).expect("order");
        assert_eq!(order.sort(), Some(Sort::Desc));
    }

    #[test]
    fn sort_words() {
        assert_eq!(Sort::parse("ASC"), Some(Sort::Asc));
        assert_eq!(Sort::parse("ascend"), Some(Sort::Asc));
        assert_eq!(Sort::parse("desc"), Some(Sort::Desc));
        assert_eq!(Sort::parse("sideways"), None);
        assert_eq!(Sort::parse(""), None);
    }
}
