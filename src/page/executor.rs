use std::collections::HashMap;
use std::marker::PhantomData;

use super::{OrderParams, PageParams, Sort};
use crate::repo::{Entity, OrderExpr, RepoError, Repository};

/// Applies client ordering and paging to a repository query.
///
/// `field_map` maps field names to columns. Client order keys are first
/// translated through an order-key map (the caller's, or the defaults), then
/// looked up in `field_map`; keys that resolve to no column are skipped.
#[derive(Debug, Clone)]
pub struct PageExecutor<T> {
    field_map: HashMap<String, String>,
    default_order_keys: HashMap<String, String>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> PageExecutor<T> {
    pub fn new(
        field_map: HashMap<String, String>,
        default_order_keys: HashMap<String, String>,
    ) -> Self {
        Self {
            field_map,
            default_order_keys,
            _entity: PhantomData,
        }
    }

    pub fn default_order_keys(&self) -> &HashMap<String, String> {
        &self.default_order_keys
    }

    /// Resolve `orders` to column orderings, in request order.
    pub fn order_exprs(
        &self,
        orders: &[OrderParams],
        order_keys: &HashMap<String, String>,
    ) -> Vec<OrderExpr> {
        orders
            .iter()
            .filter_map(|order| {
                let field = order_keys
                    .get(&order.order_key)
                    .unwrap_or(&order.order_key);
                let column = self.field_map.get(field)?;
                match order.sort()? {
                    Sort::Asc => Some(OrderExpr::asc(column.as_str())),
                    Sort::Desc => Some(OrderExpr::desc(column.as_str())),
                }
            })
            .collect()
    }

    pub fn apply_order<R: Repository<T>>(
        &self,
        repo: &R,
        orders: &[OrderParams],
        order_keys: &HashMap<String, String>,
    ) -> R {
        repo.orders(self.order_exprs(orders, order_keys))
    }

    /// Order and page `repo`, returning the page and the total row count.
    /// Without `order_keys` the executor's defaults are used.
    pub async fn execute_page_with_conditions<R: Repository<T>>(
        &self,
        repo: &R,
        page: &PageParams,
        orders: &[OrderParams],
        order_keys: Option<&HashMap<String, String>>,
    ) -> Result<(Vec<T>, u64), RepoError> {
        let keys = order_keys.unwrap_or(&self.default_order_keys);
        self.apply_order(repo, orders, keys)
            .find_by_page(page.offset(), page.limit())
            .await
    }
}
