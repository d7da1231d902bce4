//! Entitlement Module
//!
//! Answers "what can this user do right now?" from their tier alone.
//!
//! The feature matrix is a fixed table with one row per [`Tier`]. Lookups are
//! total: an out-of-range tier ordinal or an unrecognized tier name resolves to
//! the lowest tier's row instead of failing.

use std::collections::BTreeSet;

use kindred_shared::{SubscriptionStatus, Tier};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::SubscriptionRecord;

// =============================================================================
// Feature matrix
// =============================================================================

/// Maximum video quality for calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Standard,
    High,
    FullHd,
}

/// Level of access to the community forum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForumAccess {
    ReadOnly,
    Member,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLimits {
    pub voice_calls: bool,
    pub video_calls: bool,
    /// `None` means unlimited
    pub max_call_minutes: Option<u32>,
    pub video_quality: VideoQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingLimits {
    /// New conversations a user may open per day, `None` means unlimited
    pub daily_new_conversations: Option<u32>,
    pub read_receipts: bool,
    pub voice_messages: bool,
    pub message_before_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryLimits {
    /// `None` means unlimited
    pub daily_likes: Option<u32>,
    pub daily_super_likes: u32,
    pub advanced_filters: bool,
    pub incognito_mode: bool,
    pub see_who_liked_you: bool,
    pub rewind: bool,
    /// Boosts credited on each successful renewal
    pub monthly_boosts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityFeatures {
    pub forum_access: ForumAccess,
    pub ai_coaching: bool,
    /// 0 is the default queue, higher values are matched first
    pub priority_level: u8,
}

/// Everything a tier is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub tier: Tier,
    pub calls: CallLimits,
    pub messaging: MessagingLimits,
    pub discovery: DiscoveryLimits,
    pub community: CommunityFeatures,
}

/// One row per tier, indexed by [`Tier::ordinal`]
static FEATURE_TABLE: [FeatureMatrix; 3] = [
    FeatureMatrix {
        tier: Tier::Basic,
        calls: CallLimits {
            voice_calls: true,
            video_calls: false,
            max_call_minutes: Some(15),
            video_quality: VideoQuality::Standard,
        },
        messaging: MessagingLimits {
            daily_new_conversations: Some(10),
            read_receipts: false,
            voice_messages: false,
            message_before_match: false,
        },
        discovery: DiscoveryLimits {
            daily_likes: Some(25),
            daily_super_likes: 1,
            advanced_filters: false,
            incognito_mode: false,
            see_who_liked_you: false,
            rewind: false,
            monthly_boosts: 0,
        },
        community: CommunityFeatures {
            forum_access: ForumAccess::ReadOnly,
            ai_coaching: false,
            priority_level: 0,
        },
    },
    FeatureMatrix {
        tier: Tier::Premium,
        calls: CallLimits {
            voice_calls: true,
            video_calls: true,
            max_call_minutes: Some(60),
            video_quality: VideoQuality::High,
        },
        messaging: MessagingLimits {
            daily_new_conversations: None,
            read_receipts: true,
            voice_messages: true,
            message_before_match: false,
        },
        discovery: DiscoveryLimits {
            daily_likes: None,
            daily_super_likes: 5,
            advanced_filters: true,
            incognito_mode: false,
            see_who_liked_you: true,
            rewind: true,
            monthly_boosts: 1,
        },
        community: CommunityFeatures {
            forum_access: ForumAccess::Member,
            ai_coaching: false,
            priority_level: 1,
        },
    },
    FeatureMatrix {
        tier: Tier::Community,
        calls: CallLimits {
            voice_calls: true,
            video_calls: true,
            max_call_minutes: None,
            video_quality: VideoQuality::FullHd,
        },
        messaging: MessagingLimits {
            daily_new_conversations: None,
            read_receipts: true,
            voice_messages: true,
            message_before_match: true,
        },
        discovery: DiscoveryLimits {
            daily_likes: None,
            daily_super_likes: 10,
            advanced_filters: true,
            incognito_mode: true,
            see_who_liked_you: true,
            rewind: true,
            monthly_boosts: 4,
        },
        community: CommunityFeatures {
            forum_access: ForumAccess::Host,
            ai_coaching: true,
            priority_level: 2,
        },
    },
];

/// Feature matrix for a tier
pub fn resolve(tier: Tier) -> &'static FeatureMatrix {
    resolve_ordinal(tier.ordinal())
}

/// Feature matrix for a raw tier ordinal, falling back to the lowest tier
pub fn resolve_ordinal(ordinal: u8) -> &'static FeatureMatrix {
    FEATURE_TABLE
        .get(ordinal as usize)
        .unwrap_or(&FEATURE_TABLE[Tier::lowest().ordinal() as usize])
}

/// Feature matrix for a stored tier name, falling back to the lowest tier
pub fn resolve_name(name: &str) -> &'static FeatureMatrix {
    match name.parse::<Tier>() {
        Ok(tier) => resolve(tier),
        Err(_) => {
            tracing::warn!(tier = %name, "Unrecognized tier, resolving lowest tier features");
            resolve(Tier::lowest())
        }
    }
}

// =============================================================================
// Named features and access checks
// =============================================================================

/// A single gateable capability, named for access checks and upgrade prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    VoiceCalls,
    VideoCalls,
    HdVideo,
    UnlimitedCallLength,
    UnlimitedConversations,
    ReadReceipts,
    VoiceMessages,
    MessageBeforeMatch,
    UnlimitedLikes,
    AdvancedFilters,
    IncognitoMode,
    SeeWhoLikedYou,
    Rewind,
    MonthlyBoosts,
    ForumPosting,
    EventHosting,
    AiCoaching,
    PriorityMatching,
}

impl Feature {
    pub const ALL: [Feature; 18] = [
        Feature::VoiceCalls,
        Feature::VideoCalls,
        Feature::HdVideo,
        Feature::UnlimitedCallLength,
        Feature::UnlimitedConversations,
        Feature::ReadReceipts,
        Feature::VoiceMessages,
        Feature::MessageBeforeMatch,
        Feature::UnlimitedLikes,
        Feature::AdvancedFilters,
        Feature::IncognitoMode,
        Feature::SeeWhoLikedYou,
        Feature::Rewind,
        Feature::MonthlyBoosts,
        Feature::ForumPosting,
        Feature::EventHosting,
        Feature::AiCoaching,
        Feature::PriorityMatching,
    ];

    pub const fn display_name(&self) -> &'static str {
        match self {
            Feature::VoiceCalls => "Voice calls",
            Feature::VideoCalls => "Video calls",
            Feature::HdVideo => "HD video",
            Feature::UnlimitedCallLength => "Unlimited call length",
            Feature::UnlimitedConversations => "Unlimited new conversations",
            Feature::ReadReceipts => "Read receipts",
            Feature::VoiceMessages => "Voice messages",
            Feature::MessageBeforeMatch => "Messaging before a match",
            Feature::UnlimitedLikes => "Unlimited likes",
            Feature::AdvancedFilters => "Advanced filters",
            Feature::IncognitoMode => "Incognito mode",
            Feature::SeeWhoLikedYou => "See who liked you",
            Feature::Rewind => "Rewind",
            Feature::MonthlyBoosts => "Monthly boosts",
            Feature::ForumPosting => "Community forum posting",
            Feature::EventHosting => "Hosting community events",
            Feature::AiCoaching => "AI dating coach",
            Feature::PriorityMatching => "Priority matching",
        }
    }

    /// Whether the matrix grants this feature
    pub fn is_enabled(&self, matrix: &FeatureMatrix) -> bool {
        match self {
            Feature::VoiceCalls => matrix.calls.voice_calls,
            Feature::VideoCalls => matrix.calls.video_calls,
            Feature::HdVideo => {
                matrix.calls.video_calls && matrix.calls.video_quality >= VideoQuality::High
            }
            Feature::UnlimitedCallLength => matrix.calls.max_call_minutes.is_none(),
            Feature::UnlimitedConversations => matrix.messaging.daily_new_conversations.is_none(),
            Feature::ReadReceipts => matrix.messaging.read_receipts,
            Feature::VoiceMessages => matrix.messaging.voice_messages,
            Feature::MessageBeforeMatch => matrix.messaging.message_before_match,
            Feature::UnlimitedLikes => matrix.discovery.daily_likes.is_none(),
            Feature::AdvancedFilters => matrix.discovery.advanced_filters,
            Feature::IncognitoMode => matrix.discovery.incognito_mode,
            Feature::SeeWhoLikedYou => matrix.discovery.see_who_liked_you,
            Feature::Rewind => matrix.discovery.rewind,
            Feature::MonthlyBoosts => matrix.discovery.monthly_boosts > 0,
            Feature::ForumPosting => matrix.community.forum_access >= ForumAccess::Member,
            Feature::EventHosting => matrix.community.forum_access >= ForumAccess::Host,
            Feature::AiCoaching => matrix.community.ai_coaching,
            Feature::PriorityMatching => matrix.community.priority_level > 0,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace(['-', ' '], "_");
        Feature::ALL
            .into_iter()
            .find(|f| {
                serde_json::to_value(f)
                    .ok()
                    .and_then(|v| v.as_str().map(|name| name == wanted))
                    .unwrap_or(false)
            })
            .ok_or_else(|| format!("Unknown feature: {}", s))
    }
}

/// Set of features granted to a tier, cached on the entitlement snapshot
pub fn enabled_features(tier: Tier) -> BTreeSet<Feature> {
    let matrix = resolve(tier);
    Feature::ALL
        .into_iter()
        .filter(|f| f.is_enabled(matrix))
        .collect()
}

/// Result of an access check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    Allowed,
    Denied {
        feature: Feature,
        reason: String,
        upgrade_available: bool,
        required_tier: Option<Tier>,
    },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

/// Check whether `tier` may use `feature`, naming the cheapest upgrade if not
pub fn validate_access(tier: Tier, feature: Feature) -> AccessDecision {
    if feature.is_enabled(resolve(tier)) {
        return AccessDecision::Allowed;
    }

    let required_tier = Tier::ALL
        .into_iter()
        .filter(|candidate| *candidate > tier)
        .find(|candidate| feature.is_enabled(resolve(*candidate)));

    let reason = match required_tier {
        Some(required) => format!(
            "{} is not included in the {} plan. Upgrade to {} to unlock it.",
            feature.display_name(),
            tier.display_name(),
            required.display_name()
        ),
        None => format!(
            "{} is not available on the {} plan.",
            feature.display_name(),
            tier.display_name()
        ),
    };

    AccessDecision::Denied {
        feature,
        reason,
        upgrade_available: required_tier.is_some(),
        required_tier,
    }
}

// =============================================================================
// Effective tier
// =============================================================================

/// Billing standing that determines whether the paid tier applies right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// Paid and in good standing
    Active,
    /// Renewal failed but the paid period has not ended yet
    GracePeriod,
    /// Cancelled at period end, period still running
    CancelPending,
    /// Paid period over, or subscription cancelled/expired
    Lapsed,
    /// Never subscribed
    Free,
}

impl EntitlementState {
    pub fn grants_paid_tier(&self) -> bool {
        matches!(
            self,
            EntitlementState::Active
                | EntitlementState::GracePeriod
                | EntitlementState::CancelPending
        )
    }
}

/// Standing of a subscription at `now`
pub fn entitlement_state(
    subscription: Option<&SubscriptionRecord>,
    now: OffsetDateTime,
) -> EntitlementState {
    let Some(sub) = subscription else {
        return EntitlementState::Free;
    };
    let period_running = sub.current_period_end.is_some_and(|end| end > now);

    match sub.status {
        SubscriptionStatus::Active if sub.cancel_at_period_end => {
            if period_running {
                EntitlementState::CancelPending
            } else {
                EntitlementState::Lapsed
            }
        }
        SubscriptionStatus::Active => EntitlementState::Active,
        // Grace lasts until the original period end, not the provider's retry window
        SubscriptionStatus::BillingRetry if period_running => EntitlementState::GracePeriod,
        SubscriptionStatus::BillingRetry
        | SubscriptionStatus::Expired
        | SubscriptionStatus::Cancelled => EntitlementState::Lapsed,
        SubscriptionStatus::Pending => EntitlementState::Free,
    }
}

/// Tier whose features apply at `now`
pub fn effective_tier(subscription: Option<&SubscriptionRecord>, now: OffsetDateTime) -> Tier {
    match subscription {
        Some(sub) if entitlement_state(Some(sub), now).grants_paid_tier() => sub.tier,
        _ => Tier::lowest(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SubscriptionRecord;
    use kindred_shared::ProviderKind;
    use time::Duration;
    use uuid::Uuid;

    fn record(status: SubscriptionStatus, tier: Tier, period_end: OffsetDateTime) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new(Uuid::new_v4(), ProviderKind::Stripe);
        record.status = status;
        record.tier = tier;
        record.current_period_start = Some(period_end - Duration::days(30));
        record.current_period_end = Some(period_end);
        record
    }

    #[test]
    fn test_every_tier_has_its_own_row() {
        for tier in Tier::ALL {
            assert_eq!(resolve(tier).tier, tier);
        }
    }

    #[test]
    fn test_out_of_range_resolves_lowest() {
        assert_eq!(resolve_ordinal(3).tier, Tier::lowest());
        assert_eq!(resolve_ordinal(u8::MAX).tier, Tier::lowest());
        assert_eq!(resolve_name("platinum").tier, Tier::lowest());
        assert_eq!(resolve_name("Premium").tier, Tier::Premium);
    }

    #[test]
    fn test_higher_tiers_never_lose_features() {
        for pair in Tier::ALL.windows(2) {
            let lower = enabled_features(pair[0]);
            let higher = enabled_features(pair[1]);
            assert!(
                lower.is_subset(&higher),
                "{} grants features {} lacks",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_basic_limits() {
        let basic = resolve(Tier::Basic);
        assert_eq!(basic.discovery.daily_likes, Some(25));
        assert!(!basic.calls.video_calls);
        assert_eq!(basic.community.forum_access, ForumAccess::ReadOnly);
    }

    #[test]
    fn test_validate_access_allowed() {
        assert!(validate_access(Tier::Premium, Feature::VideoCalls).is_allowed());
        assert!(validate_access(Tier::Community, Feature::AiCoaching).is_allowed());
    }

    #[test]
    fn test_validate_access_denied_names_cheapest_upgrade() {
        match validate_access(Tier::Basic, Feature::SeeWhoLikedYou) {
            AccessDecision::Denied {
                reason,
                upgrade_available,
                required_tier,
                ..
            } => {
                assert!(upgrade_available);
                assert_eq!(required_tier, Some(Tier::Premium));
                assert!(reason.contains("See who liked you"));
                assert!(reason.contains("Basic"));
            }
            AccessDecision::Allowed => panic!("basic must not see likes"),
        }

        match validate_access(Tier::Premium, Feature::IncognitoMode) {
            AccessDecision::Denied { required_tier, .. } => {
                assert_eq!(required_tier, Some(Tier::Community))
            }
            AccessDecision::Allowed => panic!("premium has no incognito"),
        }
    }

    #[test]
    fn test_feature_parse() {
        assert_eq!("see_who_liked_you".parse::<Feature>().unwrap(), Feature::SeeWhoLikedYou);
        assert_eq!("AI-coaching".parse::<Feature>().unwrap(), Feature::AiCoaching);
        assert!("teleport".parse::<Feature>().is_err());
    }

    #[test]
    fn test_billing_retry_keeps_tier_until_period_end() {
        let now = OffsetDateTime::now_utc();
        let in_grace = record(SubscriptionStatus::BillingRetry, Tier::Premium, now + Duration::days(3));
        assert_eq!(entitlement_state(Some(&in_grace), now), EntitlementState::GracePeriod);
        assert_eq!(effective_tier(Some(&in_grace), now), Tier::Premium);

        let lapsed = record(SubscriptionStatus::BillingRetry, Tier::Premium, now - Duration::hours(1));
        assert_eq!(effective_tier(Some(&lapsed), now), Tier::Basic);
    }

    #[test]
    fn test_cancel_pending_and_lapsed() {
        let now = OffsetDateTime::now_utc();
        let mut sub = record(SubscriptionStatus::Active, Tier::Community, now + Duration::days(10));
        sub.cancel_at_period_end = true;
        assert_eq!(entitlement_state(Some(&sub), now), EntitlementState::CancelPending);
        assert_eq!(effective_tier(Some(&sub), now), Tier::Community);

        sub.current_period_end = Some(now - Duration::seconds(1));
        assert_eq!(effective_tier(Some(&sub), now), Tier::Basic);
    }

    #[test]
    fn test_no_subscription_is_free() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(entitlement_state(None, now), EntitlementState::Free);
        assert_eq!(effective_tier(None, now), Tier::lowest());
        let pending = record(SubscriptionStatus::Pending, Tier::Premium, now + Duration::days(1));
        assert_eq!(effective_tier(Some(&pending), now), Tier::lowest());
    }
}
